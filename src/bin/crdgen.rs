//! Prints the `Policy` CustomResourceDefinition as YAML.
//!
//! ```bash
//! cargo run --bin crdgen | kubectl apply -f -
//! ```

use kube::CustomResourceExt;
use vault_controller::policy::Policy;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Policy::crd())?);
    Ok(())
}
