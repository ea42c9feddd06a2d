//! Async driver of a [`Provider`]
//!
//! The stack owns the provider and is the only task that touches it.
//! Transports, resolver completions, timers and application commands all
//! reach it through one loop, so the engine itself never locks.

use super::message::SipMessage;
use super::provider::Provider;
use super::resolver::Resolver;
use crate::domain::shared::error::SipError;
use crate::domain::shared::value_objects::{ChannelKey, ResolveToken};
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep_until;
use tracing::{debug, info};

pub type Command = Box<dyn FnOnce(&mut Provider) + Send>;

/// Everything the loop reacts to besides timers
pub enum StackInput {
    Received {
        channel: ChannelKey,
        message: SipMessage,
    },
    ChannelError {
        channel: ChannelKey,
        reason: String,
    },
    ChannelDisconnected(ChannelKey),
    /// Closure run against the provider on the loop
    Command(Command),
}

type Resolution = BoxFuture<'static, (ResolveToken, Result<Vec<SocketAddr>, SipError>)>;

/// Cloneable access to a running stack
#[derive(Clone)]
pub struct StackHandle {
    inputs: mpsc::Sender<StackInput>,
}

impl StackHandle {
    /// Run `f` on the loop and return its result
    pub async fn call<F, R>(&self, f: F) -> Result<R, SipError>
    where
        F: FnOnce(&mut Provider) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let command: Command = Box::new(move |provider| {
            if tx.send(f(provider)).is_err() {
                debug!("Command caller went away before its result");
            }
        });
        self.inputs
            .send(StackInput::Command(command))
            .await
            .map_err(|_| SipError::Internal("Stack loop stopped".to_string()))?;
        rx.await
            .map_err(|_| SipError::Internal("Stack loop dropped the command".to_string()))
    }

    /// Queue for transports feeding the loop
    pub fn sender(&self) -> mpsc::Sender<StackInput> {
        self.inputs.clone()
    }
}

pub struct Stack {
    provider: Provider,
    resolver: Arc<dyn Resolver>,
    inputs: mpsc::Receiver<StackInput>,
}

impl Stack {
    /// The loop runs until every handle and sender is dropped
    pub fn new(provider: Provider, resolver: Arc<dyn Resolver>) -> (Self, StackHandle) {
        let (tx, rx) = mpsc::channel(1000);
        let stack = Self {
            provider,
            resolver,
            inputs: rx,
        };
        (stack, StackHandle { inputs: tx })
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut Provider {
        &mut self.provider
    }

    pub async fn run(mut self) -> Provider {
        info!("SIP stack loop started");
        let mut resolutions: FuturesUnordered<Resolution> = FuturesUnordered::new();

        loop {
            for request in self.provider.take_resolve_requests() {
                let resolver = self.resolver.clone();
                resolutions.push(
                    async move {
                        let result = resolver.resolve(&request.host, request.port).await;
                        (request.token, result)
                    }
                    .boxed(),
                );
            }
            let deadline = self.provider.next_timer_deadline();

            tokio::select! {
                input = self.inputs.recv() => match input {
                    Some(input) => self.dispatch(input),
                    None => break,
                },
                Some((token, result)) = resolutions.next(), if !resolutions.is_empty() => {
                    self.provider.on_resolved(token, result);
                }
                _ = async {
                    if let Some(deadline) = deadline {
                        sleep_until(deadline).await;
                    }
                }, if deadline.is_some() => {
                    self.provider.poll_timers();
                }
            }
        }

        info!("SIP stack loop stopped");
        self.provider
    }

    fn dispatch(&mut self, input: StackInput) {
        match input {
            StackInput::Received { channel, message } => {
                debug!("Received message on {}", channel);
                self.provider.on_message_received(channel, message);
            }
            StackInput::ChannelError { channel, reason } => {
                self.provider.on_channel_error(channel, &reason);
            }
            StackInput::ChannelDisconnected(channel) => {
                self.provider.on_channel_disconnected(channel);
            }
            StackInput::Command(command) => command(&mut self.provider),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::builder::RequestBuilder;
    use super::super::channel::testing::RecordingFactory;
    use super::super::event::SipEvent;
    use super::super::message::SipRequest;
    use super::*;
    use crate::config::Config;
    use crate::domain::shared::value_objects::SipMethod;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FixedResolver(SocketAddr);

    #[async_trait]
    impl Resolver for FixedResolver {
        async fn resolve(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>, SipError> {
            Ok(vec![self.0])
        }
    }

    fn options(target: &str) -> SipRequest {
        RequestBuilder::new(SipMethod::Options, target)
            .from("sip:alice@example.com")
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_fires_transaction_timers() {
        let (factory, wire) = RecordingFactory::new();
        let (provider, mut events) = Provider::new(Config::default(), Box::new(factory));
        let resolver = Arc::new(FixedResolver("192.0.2.30:5060".parse().unwrap()));
        let (stack, handle) = Stack::new(provider, resolver);
        tokio::spawn(stack.run());

        let key = handle
            .call(|p| {
                let key = p.create_client_transaction(options("sip:bob@192.0.2.30"))?;
                p.send_request(&key)?;
                Ok::<_, SipError>(key)
            })
            .await
            .unwrap()
            .unwrap();

        match events.recv().await {
            Some(SipEvent::Timeout { transaction }) => assert_eq!(transaction, key),
            other => panic!("expected timeout, got {:?}", other),
        }
        // initial send plus Timer E retransmissions within 64*T1
        assert_eq!(wire.lock().unwrap().sent.len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_resolves_before_sending() {
        let (factory, wire) = RecordingFactory::new();
        let (provider, _events) = Provider::new(Config::default(), Box::new(factory));
        let resolver = Arc::new(FixedResolver("192.0.2.31:5060".parse().unwrap()));
        let (stack, handle) = Stack::new(provider, resolver);
        tokio::spawn(stack.run());

        handle
            .call(|p| {
                let key = p.create_client_transaction(options("sip:bob@registrar.test"))?;
                p.send_request(&key)
            })
            .await
            .unwrap()
            .unwrap();

        for _ in 0..10 {
            if !wire.lock().unwrap().sent.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(wire.lock().unwrap().sent.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_call_keeps_loop_running() {
        let (factory, _wire) = RecordingFactory::new();
        let (provider, _events) = Provider::new(Config::default(), Box::new(factory));
        let resolver = Arc::new(FixedResolver("127.0.0.1:5060".parse().unwrap()));
        let (stack, handle) = Stack::new(provider, resolver);
        tokio::spawn(stack.run());

        let mut abandoned = Box::pin(handle.call(|p| p.config().sip.bind_port));
        assert!(futures::poll!(abandoned.as_mut()).is_pending());
        drop(abandoned);

        let port = handle.call(|p| p.config().sip.bind_port).await.unwrap();
        assert_eq!(port, Config::default().sip.bind_port);
    }

    #[tokio::test]
    async fn test_loop_stops_when_handles_drop() {
        let (factory, _wire) = RecordingFactory::new();
        let (provider, _events) = Provider::new(Config::default(), Box::new(factory));
        let resolver = Arc::new(FixedResolver("127.0.0.1:5060".parse().unwrap()));
        let (stack, handle) = Stack::new(provider, resolver);
        let task = tokio::spawn(stack.run());
        drop(handle);
        let provider = task.await.unwrap();
        assert_eq!(provider.config().sip.bind_port, Config::default().sip.bind_port);
    }
}
