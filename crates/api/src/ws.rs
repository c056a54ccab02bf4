use crate::auth::bearer_token;
use crate::messages::ClientMessage;
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use streamgate_core::{
    Credentials, ErrorCode, ExchangeAck, OutboundEvent, StreamKind, SubscriberId, Timeframe, Topic,
    Transport, UserId,
};
use tokio::sync::mpsc;

/// Public streaming channel: market-data subscriptions on the shared
/// per-exchange connections.
pub async fn public_ws(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket, None))
}

/// Private streaming channel: requires a bearer credential (header or
/// `token` query parameter) and binds every subscription to the verified
/// user. The user id is attached server-side, never taken from message
/// bodies.
pub async fn private_ws(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = bearer_token(&headers).or_else(|| params.get("token").map(String::as_str));
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing bearer credential").into_response();
    };
    match state.verifier.verify(token).await {
        Ok(user) => ws.on_upgrade(move |socket| handle_socket(state, socket, Some(user))),
        Err(err) => {
            tracing::warn!(error = %err, "rejected private connection");
            (StatusCode::UNAUTHORIZED, err.to_string()).into_response()
        }
    }
}

async fn handle_socket(state: Arc<AppState>, socket: WebSocket, user: Option<UserId>) {
    let id = SubscriberId::new();
    let (sender, mut outbound) = mpsc::unbounded_channel::<String>();
    state.transport.register(id, sender).await;
    tracing::info!(subscriber = %id, user = ?user.as_ref().map(ToString::to_string), "client connected");

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sink.send(Message::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    let conn = Conn {
        id,
        user,
        state: state.clone(),
    };
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(msg) => conn.handle(msg).await,
                Err(err) => {
                    conn.error(
                        "",
                        ErrorCode::BadRequest,
                        format!("malformed control message: {err}"),
                    )
                    .await;
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Implicit disconnect: release every subscription this connection
    // holds, then drop its transport registration.
    state.engine.disconnect(&id).await;
    state.transport.unregister(&id).await;
    writer.abort();
    tracing::info!(subscriber = %id, "client disconnected");
}

struct Conn {
    id: SubscriberId,
    user: Option<UserId>,
    state: Arc<AppState>,
}

impl Conn {
    async fn handle(&self, msg: ClientMessage) {
        use ClientMessage::*;
        match msg {
            WatchTicker {
                exchange_id,
                symbol,
            } => {
                self.watch(StreamKind::Ticker, &exchange_id, vec![symbol], None)
                    .await
            }
            UnWatchTicker {
                exchange_id,
                symbol,
            } => {
                self.unwatch(StreamKind::Ticker, &exchange_id, vec![symbol])
                    .await
            }
            WatchTickers {
                exchange_id,
                symbols,
            } => {
                self.watch(StreamKind::Ticker, &exchange_id, symbols, None)
                    .await
            }
            UnWatchTickers {
                exchange_id,
                symbols,
            } => self.unwatch(StreamKind::Ticker, &exchange_id, symbols).await,
            WatchOrderBook {
                exchange_id,
                symbol,
            } => {
                self.watch(StreamKind::OrderBook, &exchange_id, vec![symbol], None)
                    .await
            }
            UnWatchOrderBook {
                exchange_id,
                symbol,
            } => {
                self.unwatch(StreamKind::OrderBook, &exchange_id, vec![symbol])
                    .await
            }
            WatchOrderBookForSymbols {
                exchange_id,
                symbols,
            } => {
                self.watch(StreamKind::OrderBook, &exchange_id, symbols, None)
                    .await
            }
            UnWatchOrderBookForSymbols {
                exchange_id,
                symbols,
            } => {
                self.unwatch(StreamKind::OrderBook, &exchange_id, symbols)
                    .await
            }
            WatchOhlcv {
                exchange_id,
                symbol,
                timeframe,
            } => {
                self.watch(
                    StreamKind::Ohlcv,
                    &exchange_id,
                    vec![symbol],
                    Some(timeframe),
                )
                .await
            }
            UnWatchOhlcv {
                exchange_id,
                symbol,
            } => {
                self.unwatch(StreamKind::Ohlcv, &exchange_id, vec![symbol])
                    .await
            }
            Connect {
                exchange_id,
                credentials,
            } => self.connect(exchange_id, credentials).await,
            DisconnectExchange { exchange_id } => self.disconnect_exchange(exchange_id).await,
            WatchBalance { exchange_id } => {
                self.watch(StreamKind::Balance, &exchange_id, vec![], None)
                    .await
            }
            UnWatchBalance { exchange_id } => {
                self.unwatch(StreamKind::Balance, &exchange_id, vec![]).await
            }
            WatchOrders {
                exchange_id,
                symbol,
            } => {
                self.watch(
                    StreamKind::Orders,
                    &exchange_id,
                    symbol.into_iter().collect(),
                    None,
                )
                .await
            }
            UnWatchOrders {
                exchange_id,
                symbol,
            } => {
                self.unwatch(StreamKind::Orders, &exchange_id, symbol.into_iter().collect())
                    .await
            }
            WatchMyTrades {
                exchange_id,
                symbol,
            } => {
                self.watch(
                    StreamKind::MyTrades,
                    &exchange_id,
                    symbol.into_iter().collect(),
                    None,
                )
                .await
            }
            UnWatchMyTrades {
                exchange_id,
                symbol,
            } => {
                self.unwatch(
                    StreamKind::MyTrades,
                    &exchange_id,
                    symbol.into_iter().collect(),
                )
                .await
            }
            WatchPositions {
                exchange_id,
                symbols,
            } => {
                self.watch(
                    StreamKind::Positions,
                    &exchange_id,
                    symbols.unwrap_or_default(),
                    None,
                )
                .await
            }
            UnWatchPositions {
                exchange_id,
                symbols,
            } => {
                self.unwatch(
                    StreamKind::Positions,
                    &exchange_id,
                    symbols.unwrap_or_default(),
                )
                .await
            }
        }
    }

    /// Market-data topics follow the channel: public connections watch the
    /// shared feed, private connections the caller's trading connection.
    fn build_topic(
        &self,
        kind: StreamKind,
        exchange: &str,
        symbols: Vec<String>,
    ) -> Result<Topic, streamgate_core::TopicError> {
        match &self.user {
            Some(user) => Topic::private(kind, exchange, symbols, user.clone()),
            None => Topic::public(kind, exchange, symbols),
        }
    }

    async fn watch(
        &self,
        kind: StreamKind,
        exchange: &str,
        symbols: Vec<String>,
        timeframe: Option<String>,
    ) {
        let timeframe = match timeframe.as_deref().map(Timeframe::parse).transpose() {
            Ok(timeframe) => timeframe,
            Err(err) => {
                self.error("", ErrorCode::InvalidTimeframe, err.to_string())
                    .await;
                return;
            }
        };
        let topic = match self.build_topic(kind, exchange, symbols) {
            Ok(topic) => topic,
            Err(err) => {
                self.error("", ErrorCode::InvalidTopic, err.to_string()).await;
                return;
            }
        };
        let room = topic.room_name();
        match self.state.engine.subscribe(self.id, topic, timeframe).await {
            Ok(()) => {
                self.state.transport.join(&self.id, &room).await;
                self.reply(&room, &OutboundEvent::subscribed(room.clone()))
                    .await;
                tracing::info!(subscriber = %self.id, room = %room, "subscribed");
            }
            Err(err) => {
                tracing::warn!(subscriber = %self.id, room = %room, error = %err, "subscribe failed");
                self.error(&room, err.code(), err.to_string()).await;
            }
        }
    }

    async fn unwatch(&self, kind: StreamKind, exchange: &str, symbols: Vec<String>) {
        let topic = match self.build_topic(kind, exchange, symbols) {
            Ok(topic) => topic,
            Err(err) => {
                self.error("", ErrorCode::InvalidTopic, err.to_string()).await;
                return;
            }
        };
        let room = topic.room_name();
        self.state.engine.unsubscribe(&self.id, &topic).await;
        self.state.transport.leave(&self.id, &room).await;
        self.reply(&room, &OutboundEvent::unsubscribed(room.clone()))
            .await;
        tracing::info!(subscriber = %self.id, room = %room, "unsubscribed");
    }

    async fn connect(&self, exchange: String, credentials: Credentials) {
        let user = match &self.user {
            Some(user) => user.clone(),
            None => {
                self.error(
                    "",
                    ErrorCode::Unauthorized,
                    "establishing a trading connection requires the private channel",
                )
                .await;
                return;
            }
        };
        match self
            .state
            .engine
            .connect_exchange(&user, &exchange, &credentials)
            .await
        {
            Ok(()) => {
                self.reply("", &OutboundEvent::Connected(ExchangeAck { exchange }))
                    .await;
            }
            Err(err) => {
                tracing::warn!(subscriber = %self.id, exchange = %exchange, error = %err, "connect failed");
                self.error("", ErrorCode::UpstreamFailure, err.to_string())
                    .await;
            }
        }
    }

    async fn disconnect_exchange(&self, exchange: String) {
        let user = match &self.user {
            Some(user) => user.clone(),
            None => {
                self.error(
                    "",
                    ErrorCode::Unauthorized,
                    "tearing down a trading connection requires the private channel",
                )
                .await;
                return;
            }
        };
        if self.state.engine.disconnect_exchange(&user, &exchange).await {
            self.reply("", &OutboundEvent::Disconnected(ExchangeAck { exchange }))
                .await;
        } else {
            self.error(
                "",
                ErrorCode::MissingSession,
                format!("no trading connection for `{exchange}`"),
            )
            .await;
        }
    }

    async fn reply(&self, room: &str, event: &OutboundEvent) {
        self.state.transport.send(&self.id, room, event).await;
    }

    async fn error(&self, room: &str, code: ErrorCode, message: impl Into<String>) {
        self.reply(room, &OutboundEvent::error(code, message)).await;
    }
}
