use kube::CustomResourceExt;
use multi_vpc_operator::crd::{VpcConnection, VpcDns, VpcNatTunnel};

fn main() -> anyhow::Result<()> {
    let crds = [VpcNatTunnel::crd(), VpcConnection::crd(), VpcDns::crd()];
    for crd in &crds {
        println!("---");
        print!("{}", serde_yaml::to_string(crd)?);
    }
    Ok(())
}
