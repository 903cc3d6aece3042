//! etcd v3 backend
//!
//! One TLS client per process, shared by `Arc`. `etcd_client::Client` is a cheap
//! handle over a tonic channel, so each call clones it instead of locking.

use super::{CoordinationStore, EventKind, Mutation, Precondition, Versioned, WatchEvent, WatchStream};
use crate::common::{Error, Result, StoreConfig};
use async_trait::async_trait;
use etcd_client::{
    Certificate, Client, Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions,
    Identity, TlsOptions, Txn, TxnOp,
};

pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Connect with TLS client-certificate auth. Failure is fatal to the caller; no retry.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let mut options = ConnectOptions::new().with_connect_timeout(config.connect_timeout());

        if config.ca_cert.is_some() || config.cert.is_some() {
            let mut tls = TlsOptions::new();
            if let Some(ca) = &config.ca_cert {
                let pem = tokio::fs::read(ca).await?;
                tls = tls.ca_certificate(Certificate::from_pem(pem));
            }
            if let (Some(cert), Some(key)) = (&config.cert, &config.key) {
                let cert = tokio::fs::read(cert).await?;
                let key = tokio::fs::read(key).await?;
                tls = tls.identity(Identity::from_pem(cert, key));
            }
            options = options.with_tls(tls);
        }

        tracing::info!("Connecting to etcd: {}", config.endpoints.join(","));
        let mut client = Client::connect(config.endpoints.clone(), Some(options))
            .await
            .map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        match client.status().await {
            Ok(status) => tracing::info!("✓ etcd connected (version {})", status.version()),
            Err(e) => tracing::warn!("Could not read etcd version: {}", e),
        }

        Ok(Self { client })
    }

    fn client(&self) -> Client {
        self.client.clone()
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get_versioned(&self, key: &str) -> Result<Versioned> {
        let resp = self.client().get(key, None).await?;
        match resp.kvs().last() {
            Some(kv) => Ok(Versioned {
                value: kv.value_str()?.to_string(),
                revision: kv.mod_revision(),
            }),
            None => Ok(Versioned::default()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.client().put(key, value, None).await?;
        Ok(())
    }

    async fn delete(&self, key: &str, recursive: bool) -> Result<()> {
        let options = recursive.then(|| DeleteOptions::new().with_prefix());
        self.client().delete(key, options).await?;
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let options = GetOptions::new().with_prefix().with_keys_only();
        let resp = self.client().get(prefix, Some(options)).await?;
        resp.kvs()
            .iter()
            .map(|kv| Ok(kv.key_str()?.to_string()))
            .collect()
    }

    async fn commit(&self, guards: &[Precondition], mutations: &[Mutation]) -> Result<bool> {
        let compares: Vec<Compare> = guards
            .iter()
            .map(|g| Compare::mod_revision(g.key.as_str(), CompareOp::Equal, g.revision))
            .collect();
        let ops: Vec<TxnOp> = mutations
            .iter()
            .map(|m| match m {
                Mutation::Put { key, value } => TxnOp::put(key.as_str(), value.as_str(), None),
                Mutation::Delete { key } => TxnOp::delete(key.as_str(), None),
            })
            .collect();

        let resp = self.client().txn(Txn::new().when(compares).and_then(ops)).await?;
        Ok(resp.succeeded())
    }

    async fn watch(&self, key: &str) -> Result<WatchStream> {
        let (watcher, mut stream) = self
            .client()
            .watch(key, None)
            .await
            .map_err(|e| watch_error(key, e))?;
        let key = key.to_string();

        let events = async_stream::stream! {
            // Dropping the watcher closes the request side of the stream.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            yield Err(watch_error(&key, format!("canceled: {}", resp.cancel_reason())));
                            break;
                        }
                        for event in resp.events() {
                            if let Some(converted) = convert_event(event) {
                                yield converted;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(watch_error(&key, e));
                        break;
                    }
                }
            }
        };

        Ok(Box::pin(events))
    }
}

fn watch_error(key: &str, reason: impl std::fmt::Display) -> Error {
    Error::WatchStream {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

fn convert_event(event: &etcd_client::Event) -> Option<Result<WatchEvent>> {
    let kv = event.kv()?;
    let kind = match event.event_type() {
        EventType::Put => EventKind::Put,
        EventType::Delete => EventKind::Delete,
    };
    Some(event_from_kv(kind, kv))
}

fn event_from_kv(kind: EventKind, kv: &etcd_client::KeyValue) -> Result<WatchEvent> {
    let value = match kind {
        EventKind::Delete => String::new(),
        _ => kv.value_str()?.to_string(),
    };
    Ok(WatchEvent {
        kind,
        key: kv.key_str()?.to_string(),
        value,
        revision: kv.mod_revision(),
    })
}
