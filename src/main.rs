use anyhow::{anyhow, bail};
use metrics_exporter_prometheus::PrometheusBuilder;
use sipflow::config::{Config, RegistrationConfig};
use sipflow::domain::shared::value_objects::{RefresherId, SipMethod, TransactionKey};
use sipflow::infrastructure::protocols::sip::{
    build_response, Provider, RequestBuilder, SipEvent, SipHeaders, SipRequest, Stack,
    StackHandle, TokioResolver, UdpTransport, UserCredentials,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Attempts of one initial registration, challenges included
const MAX_REGISTER_ATTEMPTS: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting sipflow");

    if let Some(listen) = &config.metrics.listen {
        let addr: SocketAddr = listen.parse()?;
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    let bind: SocketAddr = format!("{}:{}", config.sip.bind_address, config.sip.bind_port).parse()?;
    let mut transport = UdpTransport::bind(bind).await?;
    let (mut provider, mut events) =
        Provider::new(config.clone(), Box::new(transport.channel_factory()));

    if let Some(registration) = &config.registration {
        if let (Some(username), Some(password)) = (&registration.username, &registration.password) {
            let mut credentials = UserCredentials::new(username, password);
            if let Some(realm) = &registration.realm {
                credentials = credentials.with_realm(realm);
            }
            provider.add_credentials(credentials);
        }
    }

    let (stack, handle) = Stack::new(provider, Arc::new(TokioResolver));
    transport.start(handle.sender());
    let stack_task = tokio::spawn(stack.run());

    let refresher = match &config.registration {
        Some(registration) => {
            match register(&handle, &mut events, registration, &config).await {
                Ok(id) => Some(id),
                Err(e) => {
                    error!("Registration failed: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    info!("sipflow running, press Ctrl-C to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => handle_event(&handle, event).await,
                None => break,
            },
        }
    }

    if let Some(id) = refresher {
        info!("Unregistering");
        handle.call(move |p| p.refresh(id, 0)).await??;
        tokio::time::sleep(Duration::from_secs(2)).await;
    }

    info!("Shutting down sipflow");
    transport.stop();
    drop(handle);
    stack_task.await?;
    Ok(())
}

fn register_request(
    registration: &RegistrationConfig,
    config: &Config,
) -> anyhow::Result<SipRequest> {
    let contact = match &registration.contact {
        Some(contact) => contact.clone(),
        None => {
            let user = registration
                .aor
                .trim_start_matches("sips:")
                .trim_start_matches("sip:")
                .split('@')
                .next()
                .unwrap_or_default();
            format!("sip:{}@{}", user, config.sip.sent_by())
        }
    };
    Ok(RequestBuilder::new(SipMethod::Register, &registration.registrar)
        .from(&registration.aor)
        .to(&registration.aor)
        .contact(&contact)
        .expires(registration.expires)
        .build()?)
}

/// Register, answering digest challenges, and hand the result to a refresher
async fn register(
    handle: &StackHandle,
    events: &mut UnboundedReceiver<SipEvent>,
    registration: &RegistrationConfig,
    config: &Config,
) -> anyhow::Result<RefresherId> {
    let request = register_request(registration, config)?;
    info!("Registering {} at {}", registration.aor, registration.registrar);
    let mut key = send(handle, request).await?;

    for _ in 0..MAX_REGISTER_ATTEMPTS {
        let status = wait_final(events, &key).await?;
        match status {
            200..=299 => {
                let id = handle
                    .call(move |p| {
                        let id = p.create_refresher(&key)?;
                        p.set_refresher_listener(
                            id,
                            Box::new(move |report| {
                                if report.failure.is_some() {
                                    warn!(
                                        "Registration refresh failed: {} {} (retry: {})",
                                        report.status_code, report.reason, report.will_retry
                                    );
                                } else {
                                    info!(
                                        "Registration refresh: {} {}",
                                        report.status_code, report.reason
                                    );
                                }
                            }),
                        )?;
                        Ok::<_, sipflow::SipError>(id)
                    })
                    .await??;
                info!("Registered, refresher {}", id);
                return Ok(id);
            }
            401 | 407 => {
                let challenged = key.clone();
                let request = handle
                    .call(move |p| p.create_authenticated_request(&challenged))
                    .await??;
                key = send(handle, request).await?;
            }
            status => bail!("registrar answered {}", status),
        }
    }
    Err(anyhow!("registration still challenged after {} attempts", MAX_REGISTER_ATTEMPTS))
}

async fn send(handle: &StackHandle, request: SipRequest) -> anyhow::Result<TransactionKey> {
    let key = handle
        .call(move |p| {
            let key = p.create_client_transaction(request)?;
            p.send_request(&key)?;
            Ok::<_, sipflow::SipError>(key)
        })
        .await??;
    Ok(key)
}

/// Status of the final response on `key`
async fn wait_final(
    events: &mut UnboundedReceiver<SipEvent>,
    key: &TransactionKey,
) -> anyhow::Result<u16> {
    while let Some(event) = events.recv().await {
        if event.transaction() != Some(key) {
            debug!("Ignoring {} while registering", event.name());
            continue;
        }
        match event {
            SipEvent::Response { response, .. } if response.is_final() => {
                return Ok(response.status_code())
            }
            SipEvent::Timeout { .. } => bail!("registration timed out"),
            SipEvent::IoError { reason, .. } => bail!("registration failed: {}", reason),
            _ => {}
        }
    }
    bail!("stack stopped")
}

/// Minimal user agent behaviour for requests nobody asked for
async fn handle_event(handle: &StackHandle, event: SipEvent) {
    match event {
        SipEvent::Request {
            transaction: Some(key),
            request,
            ..
        } => {
            let status = match request.method() {
                Some(SipMethod::Options) => 200,
                _ => 501,
            };
            info!(
                "{} from {} answered {}",
                key.method,
                request.header_value("From").unwrap_or_default(),
                status
            );
            let result = handle
                .call(move |p| {
                    let response = build_response(&request, status)?;
                    p.send_response(&key, response)
                })
                .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Cannot answer request: {}", e),
                Err(e) => warn!("Stack unavailable: {}", e),
            }
        }
        event => debug!("Event {}", event.name()),
    }
}
