use clap::Parser;
use vouch::{keys::DEFAULT_KEY_SOURCE_URL, Jwt, TokenVerifier, VerifierConfig};

#[derive(Debug, Parser)]
#[command(about = "Verifies a bearer ID token against the provider's published keys")]
struct Opts {
    /// The project the token must have been issued for
    #[arg(short, long, env = "VOUCH_PROJECT_ID")]
    project_id: String,

    /// The endpoint publishing the provider's signing certificates
    #[arg(long, env = "VOUCH_KEY_SOURCE_URL", default_value = DEFAULT_KEY_SOURCE_URL)]
    key_source_url: String,

    /// Seconds to wait for the signing certificates
    #[arg(long, default_value_t = 10)]
    timeout: u64,

    /// The token to verify, without the `Bearer ` prefix
    #[arg(env = "VOUCH_TOKEN", hide_env_values = true)]
    token: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    dotenvy::dotenv().ok();
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();
    let token = Jwt::new(opts.token);

    let config = VerifierConfig::new(opts.project_id)
        .with_key_source_url(opts.key_source_url)
        .with_fetch_timeout(std::time::Duration::from_secs(opts.timeout));
    let verifier = TokenVerifier::from_config(&config)?;

    match verifier.verify_token(&token).await {
        Ok(claims) => {
            tracing::info!(
                user_id = ?claims.user_id(),
                exp = %claims.exp(),
                "token accepted"
            );
            println!("{}", serde_json::to_string_pretty(&claims)?);
            Ok(())
        }
        Err(err) => {
            tracing::error!(kind = %err.kind(), "token rejected");
            Err(err.into())
        }
    }
}
