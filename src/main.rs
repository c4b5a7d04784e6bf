use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    lyrics_gateway::app::run().await
}
