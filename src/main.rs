#[cfg(feature = "server")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    support_desk::server::run().await
}
