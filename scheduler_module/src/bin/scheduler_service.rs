use std::error::Error;
use std::sync::Arc;

use tracing::info;

use scheduler_module::config::ServiceConfig;
use scheduler_module::credential_store::SqliteCredentialStore;
use scheduler_module::dispatcher::Dispatcher;
use scheduler_module::message_store::SqliteMessageStore;
use scheduler_module::resolver::{CredentialResolver, OAuthApp};
use scheduler_module::vault::TokenVault;
use scheduler_module::MessageScheduler;
use slack_api_module::SlackClient;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let config = ServiceConfig::from_env()?;

    let messages = Arc::new(SqliteMessageStore::new(&config.database_path)?);
    let credentials = Arc::new(SqliteCredentialStore::new(&config.database_path)?);
    let vault = TokenVault::new(config.encryption_key.clone());
    let slack = Arc::new(match &config.slack_api_base_url {
        Some(base_url) => SlackClient::with_base_url(base_url.clone()),
        None => SlackClient::new(),
    });
    let resolver = CredentialResolver::new(
        credentials,
        vault,
        slack.clone(),
        OAuthApp {
            client_id: config.slack_client_id.clone(),
            client_secret: config.slack_client_secret.clone(),
        },
    );
    let dispatcher = Dispatcher::new(messages.clone(), resolver, slack);
    let scheduler = MessageScheduler::new(messages, dispatcher, config.poll_interval);

    let mut handle = scheduler.start();
    wait_for_shutdown()?;
    info!("shutdown requested");
    handle.stop_and_join();
    Ok(())
}

fn wait_for_shutdown() -> Result<(), std::io::Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(tokio::signal::ctrl_c())
}
