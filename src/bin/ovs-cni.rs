use tracing::error;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use ovs_cni::commands::run_cni;

fn main() {
    // stdout is reserved for CNI results
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);

    if let Err(err) = run_cni() {
        error!("CNI plugin error: {}", err.msg);

        match serde_json::to_string(&err) {
            Ok(json) => println!("{}", json),
            Err(_) => println!(r#"{{"code":{},"msg":"internal error"}}"#, err.code),
        }
        std::process::exit(1);
    }
}
