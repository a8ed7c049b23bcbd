use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    esgflow_server::run().await
}
