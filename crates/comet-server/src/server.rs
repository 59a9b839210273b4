//! HTTP host engine.
//!
//! Serves the Bayeux endpoint over hyper http1: decodes each request into a
//! [`PollRequest`], drives the [`LongPollController`], holds the exchange
//! open while a poll is suspended, and encodes the reply as JSON or JSONP.
//! Also runs the periodic idle-session sweep.

use crate::bayeux::Bayeux;
use crate::config::ServerConfig;
use crate::longpoll::{LongPollController, Outcome, PollRequest};
use crate::transport::BufferedSink;
use bytes::Bytes;
use comet_core::identity::is_valid_id;
use comet_core::{
    batch_decode, batch_encode, generate_id, jsonp_encode, CometError, CometResult, Message,
    TransportKind,
};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Body;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Cookie carrying the browser identity.
pub const BROWSER_COOKIE: &str = "BAYEUX_BROWSER";

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Parameters accepted in the query string or a form body.
#[derive(Debug, Default, Deserialize)]
struct Params {
    message: Option<String>,
    jsonp: Option<String>,
}

pub struct CometServer {
    config: ServerConfig,
    controller: Arc<LongPollController>,
}

impl CometServer {
    pub fn new(config: ServerConfig) -> Self {
        let bayeux = Arc::new(Bayeux::from_config(&config));
        Self {
            config,
            controller: Arc::new(LongPollController::new(bayeux)),
        }
    }

    pub fn bayeux(&self) -> &Arc<Bayeux> {
        self.controller.bayeux()
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> CometResult<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr).await?;

        spawn_sweep_task(Arc::clone(self.bayeux()), self.config.sweep_interval);

        info!(
            addr = %addr,
            path = %self.config.path,
            timeout_ms = self.config.timeout.as_millis() as u64,
            max_sessions = self.config.max_sessions,
            "comet-server ready"
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let server = Arc::clone(&server);
                            async move { Ok::<_, Infallible>(server.handle_request(req).await) }
                        });
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!(peer = %peer, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept failed");
                }
            }
        }
    }

    /// Serve one HTTP request on the Bayeux endpoint.
    pub async fn handle_request<B>(&self, req: Request<B>) -> Response<Full<Bytes>>
    where
        B: Body,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        if req.uri().path() != self.config.path {
            return plain(StatusCode::NOT_FOUND, "not found");
        }
        if *req.method() != Method::GET && *req.method() != Method::POST {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        let query = match parse_params(req.uri().query().unwrap_or("").as_bytes()) {
            Ok(q) => q,
            Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        // Refused before any message is dispatched, so nothing is dequeued
        // for a reply that could never be written.
        if let Err(e) = TransportKind::negotiate(query.jsonp.as_deref()) {
            debug!(error = %e, "jsonp callback refused");
            return plain(StatusCode::BAD_REQUEST, &e.to_string());
        }
        let known_browser = browser_cookie(req.headers());
        let minted = known_browser.is_none();
        let browser_id = known_browser.unwrap_or_else(generate_id);
        let form = is_form(req.headers());

        let body = match Limited::new(req.into_body(), self.config.max_body_size)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                warn!(error = %e, "request body rejected");
                return plain(StatusCode::PAYLOAD_TOO_LARGE, "request body rejected");
            }
        };

        let messages = match decode_messages(&query, form, &body) {
            Ok(m) => m,
            Err(e) => {
                debug!(error = %e, "undecodable request");
                return plain(StatusCode::BAD_REQUEST, &e.to_string());
            }
        };

        let request = PollRequest {
            messages,
            jsonp: query.jsonp.clone(),
            browser_id: Some(browser_id.clone()),
        };
        let reply = match self.exchange(request).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "exchange failed");
                return plain(StatusCode::INTERNAL_SERVER_ERROR, "reply failed");
            }
        };

        let mut response = match encode_reply(query.jsonp.as_deref(), &reply) {
            Ok(r) => r,
            Err(e) => return plain(StatusCode::BAD_REQUEST, &e.to_string()),
        };
        if minted {
            let cookie = format!("{BROWSER_COOKIE}={browser_id}; Path=/; HttpOnly");
            if let Ok(value) = HeaderValue::from_str(&cookie) {
                response.headers_mut().insert(SET_COOKIE, value);
            }
        }
        response
    }

    /// Run a request through the controller, holding it open while the poll
    /// is suspended, and collect the reply.
    async fn exchange(&self, request: PollRequest) -> CometResult<Vec<Message>> {
        let (sink, reply) = BufferedSink::channel();
        match self.controller.service(request, Box::new(sink)).await? {
            Outcome::Completed => collect(reply).await,
            Outcome::Suspended(poll) => {
                debug!(
                    client_id = %poll.client_id(),
                    connection = %poll.connection(),
                    "holding exchange"
                );
                let resumed = poll.wait().await;
                let (sink, reply) = BufferedSink::channel();
                self.controller.resume(resumed, Box::new(sink)).await?;
                collect(reply).await
            }
        }
    }
}

async fn collect(reply: oneshot::Receiver<Vec<Message>>) -> CometResult<Vec<Message>> {
    reply
        .await
        .map_err(|_| CometError::Transport("reply was never completed".into()))
}

/// Periodically disconnect sessions that stopped polling.
pub fn spawn_sweep_task(bayeux: Arc<Bayeux>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = bayeux.sweep().await;
            if !removed.is_empty() {
                info!(count = removed.len(), "swept idle sessions");
            }
            let sessions = bayeux.sessions().list().await;
            let channels = bayeux.channels().count().await;
            debug!(
                sessions = sessions.len(),
                channels = channels,
                suspended = sessions.iter().filter(|s| s.suspended).count(),
                queued = sessions.iter().map(|s| s.queued).sum::<usize>(),
                "session summary"
            );
        }
    })
}

fn parse_params(raw: &[u8]) -> CometResult<Params> {
    serde_urlencoded::from_bytes(raw).map_err(|e| CometError::InvalidMessage(e.to_string()))
}

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(FORM_CONTENT_TYPE))
}

/// Browser id from the request cookie, if it is well formed.
fn browser_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == BROWSER_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|id| is_valid_id(id))
}

/// Messages come from a form `message` field, the `message` query parameter,
/// or a raw JSON body, in that order.
fn decode_messages(query: &Params, form: bool, body: &[u8]) -> CometResult<Vec<Message>> {
    if form {
        if let Some(message) = parse_params(body)?.message {
            return batch_decode(message.as_bytes());
        }
    }
    if let Some(message) = &query.message {
        return batch_decode(message.as_bytes());
    }
    batch_decode(body)
}

fn encode_reply(jsonp: Option<&str>, reply: &[Message]) -> CometResult<Response<Full<Bytes>>> {
    let (body, content_type) = match jsonp {
        Some(callback) => (jsonp_encode(callback, reply)?, "text/javascript; charset=utf-8"),
        None => (batch_encode(reply)?, "application/json; charset=utf-8"),
    };
    let mut response = Response::new(Full::new(Bytes::from(body)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    Ok(response)
}

fn plain(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(text.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn server() -> CometServer {
        CometServer::new(ServerConfig {
            timeout: Duration::from_secs(5),
            ..ServerConfig::default()
        })
    }

    fn post(body: &str) -> Request<Full<Bytes>> {
        Request::post("/cometd")
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap()
    }

    async fn body_json(response: Response<Full<Bytes>>) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn cookie_is_read_only_when_valid() {
        let mut headers = HeaderMap::new();
        let id = generate_id();
        headers.insert(
            COOKIE,
            HeaderValue::from_str(&format!("a=1; {BROWSER_COOKIE}={id}")).unwrap(),
        );
        assert_eq!(browser_cookie(&headers), Some(id));

        headers.insert(COOKIE, HeaderValue::from_static("BAYEUX_BROWSER=../x"));
        assert_eq!(browser_cookie(&headers), None);
    }

    #[test]
    fn messages_decode_from_form_query_or_body() {
        let form = b"message=%5B%7B%22channel%22%3A%22%2Fa%22%7D%5D";
        let msgs = decode_messages(&Params::default(), true, form).unwrap();
        assert_eq!(msgs[0].channel, "/a");

        let query = Params {
            message: Some(r#"{"channel":"/b"}"#.into()),
            jsonp: None,
        };
        assert_eq!(decode_messages(&query, false, b"").unwrap()[0].channel, "/b");

        let msgs = decode_messages(&Params::default(), false, br#"[{"channel":"/c"}]"#).unwrap();
        assert_eq!(msgs[0].channel, "/c");
        assert!(decode_messages(&Params::default(), false, b"{nope").is_err());
    }

    #[tokio::test]
    async fn handshake_over_http_sets_browser_cookie() {
        let server = server();
        let response = server
            .handle_request(post(r#"[{"channel":"/meta/handshake","id":"1"}]"#))
            .await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with(BROWSER_COOKIE)));
        let reply = body_json(response).await;
        assert_eq!(reply[0]["successful"], json!(true));
        assert_eq!(reply[0]["id"], json!("1"));
    }

    #[tokio::test]
    async fn jsonp_wraps_the_reply() {
        let server = server();
        let req = Request::get("/cometd?jsonp=cb&message=%7B%22channel%22%3A%22%2Fmeta%2Fhandshake%22%7D")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let response = server.handle_request(req).await;

        assert_eq!(
            response.headers()[CONTENT_TYPE],
            "text/javascript; charset=utf-8"
        );
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.starts_with(b"cb(["));
    }

    #[tokio::test]
    async fn wrong_path_and_bad_body_are_rejected() {
        let server = server();
        let req = Request::post("/elsewhere")
            .body(Full::new(Bytes::new()))
            .unwrap();
        assert_eq!(server.handle_request(req).await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            server.handle_request(post("not json")).await.status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn bad_jsonp_callback_leaves_mailbox_alone() {
        let server = server();
        let handshake = body_json(
            server
                .handle_request(post(r#"[{"channel":"/meta/handshake"}]"#))
                .await,
        )
        .await;
        let client_id = handshake[0]["clientId"].as_str().unwrap().to_string();
        server
            .bayeux()
            .deliver(&client_id, Message::new("/x"))
            .await
            .unwrap();

        let uri = format!(
            "/cometd?jsonp=bad%28&message=%7B%22channel%22%3A%22%2Fmeta%2Fconnect%22%2C%22clientId%22%3A%22{client_id}%22%7D"
        );
        let req = Request::get(uri).body(Full::new(Bytes::new())).unwrap();
        let response = server.handle_request(req).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let session = server.bayeux().sessions().get(&client_id).unwrap();
        assert_eq!(session.lock().await.queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn suspended_poll_answers_when_a_message_arrives() {
        let server = Arc::new(server());
        let handshake = body_json(
            server
                .handle_request(post(r#"[{"channel":"/meta/handshake"}]"#))
                .await,
        )
        .await;
        let client_id = handshake[0]["clientId"].as_str().unwrap().to_string();

        let bayeux = Arc::clone(server.bayeux());
        let target = client_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let msg = Message {
                data: Some(json!({"foo": "bar"})),
                ..Message::new("/x")
            };
            bayeux.deliver(&target, msg).await.unwrap();
        });

        let poll = format!(r#"[{{"channel":"/meta/connect","clientId":"{client_id}"}}]"#);
        let reply = body_json(server.handle_request(post(&poll)).await).await;

        assert_eq!(reply.as_array().unwrap().len(), 2);
        assert_eq!(reply[0]["channel"], json!("/meta/connect"));
        assert_eq!(reply[1]["data"], json!({"foo": "bar"}));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_task_expires_idle_sessions() {
        let server = CometServer::new(ServerConfig {
            timeout: Duration::from_secs(1),
            max_interval: Duration::from_secs(1),
            ..ServerConfig::default()
        });
        server
            .handle_request(post(r#"[{"channel":"/meta/handshake"}]"#))
            .await;
        assert_eq!(server.bayeux().sessions().count(), 1);

        let sweeper = spawn_sweep_task(Arc::clone(server.bayeux()), Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(4)).await;
        sweeper.abort();

        assert_eq!(server.bayeux().sessions().count(), 0);
    }
}
