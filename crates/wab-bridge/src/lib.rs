//! HTTP adapter for the WhatsApp protocol bridge.
//!
//! The bridge is a separate process that owns the WhatsApp socket and the
//! auth state on disk. This crate implements the core messaging ports on top
//! of its JSON API: commands are plain POSTs, events arrive through a long
//! poll that feeds the session's event channel.

mod wire;

use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use wab_core::{
    domain::{Jid, MessageKey, PhoneNumber},
    errors::Error,
    messaging::{
        port::{Connection, ProtocolConnector, WhatsAppClient},
        types::{
            ClientCapabilities, DocumentAttachment, GroupMetadata,
            OutgoingMessage, ParticipantAction, Presence, ProtocolEvent,
        },
    },
    Result,
};

use wire::{
    ConnectResponse, DocumentMeta, PairingRequest, PairingResponse, ParticipantsRequest,
    PresenceRequest, ReadRequest, RejectCallRequest, SendRequest, SendResponse, WireMessage,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_WAIT_SECS: u64 = 25;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(2);
const EVENT_BUFFER: usize = 64;

#[derive(Clone)]
struct BridgeApi {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl BridgeApi {
    fn session_url(&self, phone: &PhoneNumber, path: &str) -> String {
        format!("{}/sessions/{}/{}", self.base_url, phone, path)
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn parse<T: DeserializeOwned + Default>(
        what: &str,
        resp: reqwest::Response,
    ) -> Result<T> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Protocol(format!(
                "bridge {what} failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        let bytes = resp.bytes().await?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(T::default());
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned + Default>(
        &self,
        phone: &PhoneNumber,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let resp = self
            .authed(self.http.post(self.session_url(phone, path)))
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("bridge {path} request error: {e}")))?;
        Self::parse(path, resp).await
    }

    async fn poll_events(&self, phone: &PhoneNumber) -> Result<Vec<ProtocolEvent>> {
        let resp = self
            .authed(self.http.get(self.session_url(phone, "events")))
            .query(&[("wait", POLL_WAIT_SECS)])
            .timeout(Duration::from_secs(POLL_WAIT_SECS) + REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("bridge events request error: {e}")))?;
        Self::parse("events", resp).await
    }
}

/// Opens sessions on the bridge.
pub struct BridgeConnector {
    api: BridgeApi,
}

impl BridgeConnector {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::External(format!("http client build failed: {e}")))?;
        Ok(Self {
            api: BridgeApi {
                base_url: base_url.trim_end_matches('/').to_string(),
                token,
                http,
            },
        })
    }
}

#[async_trait]
impl ProtocolConnector for BridgeConnector {
    async fn connect(&self, phone: &PhoneNumber, auth_dir: &Path) -> Result<Connection> {
        let body = serde_json::json!({ "authDir": auth_dir });
        let resp: ConnectResponse = self.api.post(phone, "connect", &body).await?;
        tracing::info!("[BRIDGE] Connected {phone}");

        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(pump_events(
            self.api.clone(),
            phone.clone(),
            tx,
            cancel.clone(),
        ));

        let client = BridgeClient {
            api: self.api.clone(),
            phone: phone.clone(),
            capabilities: resp.capabilities.into(),
            cancel,
        };
        Ok(Connection {
            client: Arc::new(client),
            events: rx,
        })
    }
}

/// Long-poll loop for one connection. Ends on cancel, on a `Closed` event, or
/// when the receiver is gone.
async fn pump_events(
    api: BridgeApi,
    phone: PhoneNumber,
    tx: mpsc::Sender<ProtocolEvent>,
    cancel: CancellationToken,
) {
    loop {
        let batch = tokio::select! {
            _ = cancel.cancelled() => return,
            res = api.poll_events(&phone) => res,
        };

        let events = match batch {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!("[BRIDGE] Event poll for {phone} failed: {e}");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(POLL_RETRY_DELAY) => continue,
                }
            }
        };

        for event in events {
            let closed = matches!(event, ProtocolEvent::Closed { .. });
            if tx.send(event).await.is_err() {
                return;
            }
            if closed {
                tracing::debug!("[BRIDGE] {phone} reported close, stopping poll");
                return;
            }
        }
    }
}

/// Client half of a bridge connection.
pub struct BridgeClient {
    api: BridgeApi,
    phone: PhoneNumber,
    capabilities: ClientCapabilities,
    cancel: CancellationToken,
}

impl BridgeClient {
    async fn send_document(&self, to: &Jid, doc: &DocumentAttachment) -> Result<SendResponse> {
        let meta = DocumentMeta {
            to,
            file_name: &doc.file_name,
            mimetype: &doc.mimetype,
            caption: doc.caption.as_deref(),
        };
        let file = reqwest::multipart::Part::bytes(doc.data.clone())
            .file_name(doc.file_name.clone())
            .mime_str(&doc.mimetype)
            .map_err(|e| Error::Protocol(format!("bridge multipart error: {e}")))?;
        let form = reqwest::multipart::Form::new()
            .text("meta", serde_json::to_string(&meta)?)
            .part("file", file);

        let resp = self
            .api
            .authed(
                self.api
                    .http
                    .post(self.api.session_url(&self.phone, "send-document")),
            )
            .multipart(form)
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("bridge send-document request error: {e}")))?;
        BridgeApi::parse("send-document", resp).await
    }
}

#[async_trait]
impl WhatsAppClient for BridgeClient {
    fn capabilities(&self) -> ClientCapabilities {
        self.capabilities
    }

    async fn send(&self, to: &Jid, message: OutgoingMessage) -> Result<Option<MessageKey>> {
        let resp = match WireMessage::from_message(&message) {
            Some(wire) => {
                let body = SendRequest { to, message: wire };
                self.api
                    .post::<_, SendResponse>(&self.phone, "send", &body)
                    .await?
            }
            None => match &message {
                OutgoingMessage::Document(doc) => self.send_document(to, doc).await?,
                _ => SendResponse::default(),
            },
        };
        tracing::debug!("[BRIDGE] {} sent {} to {to}", self.phone, message.kind());
        Ok(resp.key)
    }

    async fn read_messages(&self, keys: &[MessageKey]) -> Result<()> {
        self.api
            .post::<_, serde_json::Value>(&self.phone, "read", &ReadRequest { keys })
            .await?;
        Ok(())
    }

    async fn send_presence(&self, presence: Presence, to: Option<&Jid>) -> Result<()> {
        self.api
            .post::<_, serde_json::Value>(
                &self.phone,
                "presence",
                &PresenceRequest { presence, to },
            )
            .await?;
        Ok(())
    }

    async fn reject_call(&self, call_id: &str, from: &Jid) -> Result<()> {
        self.api
            .post::<_, serde_json::Value>(
                &self.phone,
                "reject-call",
                &RejectCallRequest { call_id, from },
            )
            .await?;
        Ok(())
    }

    async fn group_metadata(&self, group: &Jid) -> Result<GroupMetadata> {
        let url = self
            .api
            .session_url(&self.phone, &format!("groups/{}", group.as_str()));
        let resp = self
            .api
            .authed(self.api.http.get(url))
            .send()
            .await
            .map_err(|e| Error::Protocol(format!("bridge groups request error: {e}")))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("group {group}")));
        }
        let status = resp.status();
        if !status.is_success() {
            return Err(Error::Protocol(format!("bridge groups failed: {status}")));
        }
        Ok(resp.json().await?)
    }

    async fn group_participants_update(
        &self,
        group: &Jid,
        participants: &[Jid],
        action: ParticipantAction,
    ) -> Result<()> {
        let body = ParticipantsRequest {
            group,
            participants,
            action,
        };
        self.api
            .post::<_, serde_json::Value>(&self.phone, "group-participants", &body)
            .await?;
        Ok(())
    }

    async fn request_pairing_code(
        &self,
        phone: &PhoneNumber,
        custom_code: Option<&str>,
    ) -> Result<String> {
        let body = PairingRequest {
            phone_number: phone.as_str(),
            custom_code,
        };
        let resp: Option<PairingResponse> =
            self.api.post(&self.phone, "pairing-code", &body).await?;
        resp.map(|r| r.code)
            .ok_or_else(|| Error::Protocol("bridge returned no pairing code".to_string()))
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.api
            .post::<_, serde_json::Value>(&self.phone, "close", &serde_json::json!({}))
            .await?;
        tracing::info!("[BRIDGE] Closed {}", self.phone);
        Ok(())
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::{
        extract::{Path as AxumPath, State},
        routing::{get, post},
        Json, Router,
    };
    use serde_json::{json, Value};
    use wab_core::messaging::types::DisconnectReason;

    use super::*;

    #[derive(Clone, Default)]
    struct Stub {
        calls: Arc<Mutex<Vec<(String, Value)>>>,
        polled: Arc<Mutex<bool>>,
    }

    async fn connect(
        State(stub): State<Stub>,
        AxumPath(phone): AxumPath<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        stub.calls
            .lock()
            .unwrap()
            .push((format!("{phone}/connect"), body));
        Json(json!({"capabilities": {"buttons": true}}))
    }

    async fn events(State(stub): State<Stub>) -> Json<Value> {
        let mut polled = stub.polled.lock().unwrap();
        if *polled {
            return Json(json!([{"type": "closed", "reason": "logged_out"}]));
        }
        *polled = true;
        Json(json!([
            {"type": "open", "account": {"jid": "15550001:2@s.whatsapp.net"}},
            {"type": "creds_updated"}
        ]))
    }

    async fn send(
        State(stub): State<Stub>,
        AxumPath(phone): AxumPath<String>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        stub.calls.lock().unwrap().push((format!("{phone}/send"), body));
        Json(json!({"key": {"remoteJid": "1555@s.whatsapp.net", "id": "OUT1", "fromMe": true}}))
    }

    async fn pairing(Json(body): Json<Value>) -> Json<Value> {
        let code = body["customCode"].as_str().unwrap_or("ZZZZ9999").to_string();
        Json(json!({ "code": code }))
    }

    async fn serve(stub: Stub) -> String {
        let app = Router::new()
            .route("/sessions/:phone/connect", post(connect))
            .route("/sessions/:phone/events", get(events))
            .route("/sessions/:phone/send", post(send))
            .route("/sessions/:phone/pairing-code", post(pairing))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn connect_streams_events_until_close() {
        let stub = Stub::default();
        let base = serve(stub.clone()).await;
        let connector = BridgeConnector::new(&format!("{base}/"), None).unwrap();
        let phone = PhoneNumber::parse("15550001").unwrap();

        let mut conn = connector
            .connect(&phone, Path::new("/data/sessions/15550001"))
            .await
            .unwrap();
        assert!(conn.client.capabilities().supports_buttons);
        assert!(!conn.client.capabilities().supports_lists);

        let mut seen = Vec::new();
        while let Some(ev) = conn.events.recv().await {
            seen.push(ev);
        }
        assert_eq!(seen.len(), 3);
        assert!(matches!(seen[0], ProtocolEvent::Open { .. }));
        assert!(matches!(
            seen[2],
            ProtocolEvent::Closed {
                reason: DisconnectReason::LoggedOut
            }
        ));

        let calls = stub.calls.lock().unwrap();
        assert_eq!(calls[0].0, "15550001/connect");
        assert_eq!(calls[0].1["authDir"], "/data/sessions/15550001");
    }

    #[tokio::test]
    async fn send_and_pairing_round_trip() {
        let stub = Stub::default();
        let base = serve(stub.clone()).await;
        let connector = BridgeConnector::new(&base, None).unwrap();
        let phone = PhoneNumber::parse("15550001").unwrap();
        let conn = connector.connect(&phone, Path::new("/tmp/a")).await.unwrap();

        let key = conn
            .client
            .send(&Jid::new("1555@s.whatsapp.net"), OutgoingMessage::text("hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key.id, "OUT1");
        {
            let calls = stub.calls.lock().unwrap();
            let (path, body) = calls.last().unwrap();
            assert_eq!(path, "15550001/send");
            assert_eq!(body["to"], "1555@s.whatsapp.net");
            assert_eq!(body["message"], json!({"type": "text", "text": "hello"}));
        }

        let code = conn
            .client
            .request_pairing_code(&phone, Some("ABCD1234"))
            .await
            .unwrap();
        assert_eq!(code, "ABCD1234");
    }

    #[tokio::test]
    async fn unreachable_bridge_fails_connect() {
        let connector = BridgeConnector::new("http://127.0.0.1:9", None).unwrap();
        let phone = PhoneNumber::parse("15550001").unwrap();
        let err = connector
            .connect(&phone, Path::new("/tmp/a"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
