// Client creation with custom user-agent support for kube 2.x
use crate::error::Result;
use hyper::http::{HeaderName, HeaderValue};
use kube::{Client, Config};
use tracing::warn;

/// Environment variable overriding the user agent passed to [`new`]
pub const USER_AGENT_ENV: &str = "KUBE_INFORMER_USER_AGENT";

/// Create a new k8s client from the inferred kubeconfig / in-cluster config
///
/// # Errors
///
/// Will return `Err` if no cluster config can be inferred or the client cannot be built
pub async fn new(custom_user_agent: Option<&str>) -> Result<Client> {
    let mut config = Config::infer().await?;

    let user_agent = std::env::var(USER_AGENT_ENV)
        .ok()
        .or_else(|| custom_user_agent.map(str::to_string));
    if let Some(user_agent) = user_agent {
        match HeaderValue::from_str(&user_agent) {
            Ok(value) => config
                .headers
                .push((HeaderName::from_static("user-agent"), value)),
            Err(e) => warn!("⚠️  ignoring invalid user agent {:?}: {}", user_agent, e),
        }
    }

    let client = Client::try_from(config)?;
    Ok(client)
}
