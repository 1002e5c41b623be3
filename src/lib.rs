pub mod agent;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod llm;
pub mod models;
pub mod server;

use agent::Assistant;
use cli::Args;
use log::info;
use server::Server;
use std::error::Error;
use std::sync::Arc;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("--- Core Configuration ---");
    info!("Server Address: {}", args.server_addr);
    info!(
        "HTTP API Port: {}",
        args.http_port.map(|p| p.to_string()).unwrap_or_else(|| "disabled".to_string())
    );
    info!("Chat Model: {}", args.chat_model.as_deref().unwrap_or("adapter default"));
    info!("Vision Model: {}", args.vision_model.as_deref().unwrap_or("adapter default"));
    info!("Default Persona: {}", args.persona);
    info!("Prompts Path: {}", args.prompts_path.as_deref().unwrap_or("built-in defaults"));
    info!("Thinking Budget: {}", args.thinking_budget);
    info!("TLS Enabled: {}", args.enable_tls);
    info!("-------------------------");

    let assistant = Arc::new(Assistant::new(&args)?);
    let addr = args.server_addr.clone();
    info!("Starting server on: {}", addr);
    let server = Server::new(addr, assistant, args.server_api_key.clone(), args.clone());
    server.run().await?;

    Ok(())
}
