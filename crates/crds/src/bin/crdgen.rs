//! Prints the Prefix and PrefixAllocation CRDs as a multi-document YAML stream.

use crds::{Prefix, PrefixAllocation};
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&Prefix::crd())?);
    println!("---");
    print!("{}", serde_yaml::to_string(&PrefixAllocation::crd())?);
    Ok(())
}
