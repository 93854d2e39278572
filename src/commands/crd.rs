use anyhow::Result;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

use apollo::crd::{Device, DeviceProcess, DeviceProcessDeployment};

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![Device::crd(), DeviceProcess::crd(), DeviceProcessDeployment::crd()]
}

/// Print the Device/DeviceProcess/DeviceProcessDeployment CRD YAML to stdout
/// for `kubectl apply -f`, one `---`-separated document per CRD.
pub fn generate() -> Result<()> {
    for crd in all_crds() {
        println!("{}", serde_yaml::to_string(&crd)?);
        println!("---");
    }
    Ok(())
}

/// Apply all three CRDs directly to the connected cluster.
pub async fn install() -> Result<()> {
    use kube::{Api, Client};

    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists, skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
