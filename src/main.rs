mod app;
mod config;
mod error;
mod events;
mod gateway;
mod llm;
mod prompting;
mod qualification;
mod queue;
mod realtime;
mod store;
#[cfg(test)]
mod testing;
mod types;
mod worker;

#[tokio::main]
async fn main() {
    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "server stopped");
        eprintln!("lead-chat-server: {err}");
        std::process::exit(1);
    }
}
