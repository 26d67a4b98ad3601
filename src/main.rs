use anyhow::Result;
use tracing::metadata::LevelFilter;
use zlock::cli::Opts;
use zlock::logger;
use zlock::server::LockServer;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let opts = Opts::read();

    logger::init_tracing(LevelFilter::DEBUG, opts.json)?;

    let (server, handle) = LockServer::bind(opts.listen_address()).await?;

    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutting down on interrupt");
                if let Err(e) = handle.stop().await {
                    tracing::error!("Failed to stop server: {e:#}");
                }
            }
        }
    });

    server.run().await
}
