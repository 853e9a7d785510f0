use std::{path::PathBuf, sync::Arc, time::Duration};

use aliri::jwt;
use aliri_credentials::{
    CacheSettings, ClientCredential, ClientId, CredentialDescription, CredentialResolutionChain,
    LoaderParameters, LoaderRegistry, SkipPolicy,
};
use clap::Parser;
use tokio::time;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
struct Opts {
    /// A JSON file holding the ordered list of credential descriptions
    #[clap(short = 'f', long, env, default_value = "credentials.json")]
    credentials_file: PathBuf,

    /// The client ID of the client
    #[clap(short, long, env)]
    client_id: ClientId,

    /// The audience of signed assertions, usually the authority's token URL
    #[clap(short, long, env)]
    audience: jwt::Audience,

    /// Seconds before expiry at which a cached assertion is replaced
    #[clap(long, env, default_value_t = 0)]
    expiry_margin: u64,

    /// Keep unavailable sources skipped instead of retrying them on each resolution
    #[clap(long)]
    persist_skips: bool,

    /// Number of credentials to request after resolving
    #[clap(short = 'n', long, default_value_t = 3)]
    requests: u32,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .pretty()
        .with_env_filter(tracing_subscriber::filter::EnvFilter::from_default_env())
        .init();

    let opts = Opts::parse();

    let data = tokio::fs::read_to_string(&opts.credentials_file).await?;
    let descriptions: Vec<CredentialDescription> = serde_json::from_str(&data)?;

    let settings =
        CacheSettings::default().with_expiry_margin(Duration::from_secs(opts.expiry_margin));
    let skip_policy = if opts.persist_skips {
        SkipPolicy::Persist
    } else {
        SkipPolicy::ResetEachAttempt
    };
    let chain = Arc::new(
        CredentialResolutionChain::new(LoaderRegistry::with_default_loaders_and_settings(
            settings,
        ))
        .with_skip_policy(skip_policy),
    );

    let cancellation = CancellationToken::new();
    {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancellation.cancel();
            }
        });
    }

    let params = LoaderParameters::new()
        .with_client_id(opts.client_id)
        .with_audience(opts.audience)
        .with_cancellation(cancellation.clone());

    let resolved = chain.resolve_first_viable(&descriptions, &params).await?;

    tracing::info!(
        index = resolved.index(),
        name = resolved.name(),
        source_kind = %resolved.kind(),
        "resolved credential source"
    );

    let mut interval = time::interval(Duration::from_secs(5));
    for _ in 0..opts.requests {
        interval.tick().await;

        match resolved.client_credential(&cancellation).await? {
            ClientCredential::Assertion(assertion) => {
                tracing::info!(
                    assertion = format_args!("{:#?}", assertion),
                    "obtained signed assertion"
                );
            }
            ClientCredential::Secret(secret) => {
                tracing::info!(secret = %secret, "obtained client secret");
            }
        }
    }

    Ok(())
}
