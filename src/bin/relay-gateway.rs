use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or(
        "usage: relay-gateway <config.json> [--listen HOST:PORT] [--json-logs]",
    )?;

    let mut listen: Option<String> = None;
    let mut json_logs = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => return Err(format!("unknown arg: {other}").into()),
        }
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let raw = std::fs::read_to_string(&path)?;
    let settings: relay_llm::RelaySettings = serde_json::from_str(&raw)?;
    let listen = listen.unwrap_or_else(|| settings.listen.clone());

    let state = relay_llm::RelayState::new(settings);
    let app = relay_llm::router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "relay-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
