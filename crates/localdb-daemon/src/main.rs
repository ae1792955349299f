use anyhow::Result;

use localdb_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("localdb-daemon")?;
    localdb_daemon::server::run().await
}
