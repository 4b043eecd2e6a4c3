use std::time::Duration;

use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::ListParams;
use kube::{Api, Client};

use kube_mender::clients::ReflexionClient;

pub async fn run(reflexion_url: Option<String>) -> anyhow::Result<()> {
    println!("Running remediation preflight checks...\n");

    // 1. Build Kubernetes client from kubeconfig
    print!("  Kubeconfig .................. ");
    let client = match Client::try_default().await {
        Ok(c) => {
            println!("OK");
            c
        }
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot load kubeconfig: {}", e);
        }
    };

    // 2. Verify actual cluster connectivity by fetching server version
    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            println!("\n  Error: {}", e);
            println!("  Hint:  Is the cluster running? Check with: kubectl cluster-info\n");
            return Ok(());
        }
    }

    // 3. List pods permission (detection needs it)
    print!("  List pods permission ........ ");
    let pods: Api<Pod> = Api::all(client.clone());
    match pods.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 4. List events permission (context gathering needs it)
    print!("  List events permission ...... ");
    let events: Api<Event> = Api::all(client.clone());
    match events.list(&ListParams::default().limit(1)).await {
        Ok(_) => println!("OK"),
        Err(e) => println!("FAIL ({})", e),
    }

    // 5. Reflexion service, if an address was given
    if let Some(url) = reflexion_url {
        print!("  Reflexion service ........... ");
        match ReflexionClient::new(&url, Duration::from_secs(5)) {
            Ok(reflexion) => match reflexion.health().await {
                Ok(health) => println!(
                    "OK (status: {})",
                    health["status"].as_str().unwrap_or("unknown")
                ),
                Err(e) => println!("FAIL ({})", e),
            },
            Err(e) => println!("FAIL ({})", e),
        }
    }

    println!("\nAll checks completed.");
    Ok(())
}
