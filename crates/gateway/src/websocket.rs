//! WebSocket 入口与事件分发
//!
//! 连接在升级前用查询参数里的会话令牌换取用户身份。之后一条连接对应
//! 一个出站通道：分发回执和扇出帧都写进同一个通道，由发送任务串行
//! 写回 socket。错误回执只发给肇事连接，从不广播。

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use chrono::Utc;
use domain::{ConnectionId, DomainError, RoomId, UserId};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::envelope::{ClientEvent, SocketReply};
use crate::error::ApiError;
use crate::registry::OutboundSender;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub(crate) struct WsQuery {
    token: String,
}

/// 升级握手。令牌无效时直接拒绝，连接不会进入注册表。
pub(crate) async fn websocket_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let user_id = state.verifier.verify(&query.token)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, user_id: UserId) {
    let conn_id = ConnectionId::generate();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    debug!(conn_id = %conn_id, user_id = %user_id, "websocket 连接建立");

    while let Some(Ok(frame)) = ws_rx.next().await {
        match frame {
            Message::Text(raw) => {
                let reply = dispatch(&state, conn_id, user_id, &out_tx, raw.as_str()).await;
                let encoded = match serde_json::to_string(&reply) {
                    Ok(encoded) => encoded,
                    Err(err) => {
                        error!(conn_id = %conn_id, error = %err, "序列化回执失败");
                        continue;
                    }
                };
                if out_tx.send(encoded).is_err() {
                    break;
                }
            }
            Message::Close(_) => break,
            // ping/pong 由协议层处理，二进制帧忽略
            _ => {}
        }
    }

    // 断开即清场：所有房间摘除，空房间退订
    state.registry.disconnect(conn_id).await;
    send_task.abort();
    debug!(conn_id = %conn_id, user_id = %user_id, "websocket 连接关闭");
}

/// 单条入站事件的处理，总是产生一条回执。
async fn dispatch(
    state: &AppState,
    conn_id: ConnectionId,
    user_id: UserId,
    out: &OutboundSender,
    raw: &str,
) -> SocketReply {
    let event: ClientEvent = match serde_json::from_str(raw) {
        Ok(event) => event,
        Err(err) => {
            return SocketReply::rejected(
                "ERROR",
                &DomainError::validation(format!("malformed event: {err}")),
            );
        }
    };
    let name = event.name();
    if let Err(err) = event.validate_data() {
        return SocketReply::rejected(name, &err);
    }

    let result = match event {
        ClientEvent::Join(data) => {
            let room_id = RoomId::from(data.room_id);
            state
                .registry
                .attach(conn_id, user_id, out.clone(), room_id)
                .await
                .map(|_| Some(json!({ "roomId": data.room_id })))
        }
        ClientEvent::Leave(data) => {
            let room_id = RoomId::from(data.room_id);
            state
                .registry
                .detach(conn_id, room_id)
                .await
                .map(|_| Some(json!({ "roomId": data.room_id })))
        }
        ClientEvent::Broadcast(data) => {
            let room_id = RoomId::from(data.room_id);
            state
                .registry
                .broadcast(conn_id, user_id, room_id, data.content, data.kind)
                .await
                .and_then(|message| Ok(Some(serde_json::to_value(&message)?)))
        }
        ClientEvent::RoomsNearMe(data) => state
            .geo
            .nearby_rooms(data.lat, data.lng, Utc::now())
            .await
            .and_then(|rooms| Ok(Some(serde_json::to_value(&rooms)?))),
    };

    match result {
        Ok(data) => SocketReply::ok(name, data),
        Err(err) => match err.as_domain() {
            Some(domain_err) => SocketReply::rejected(name, domain_err),
            None => {
                error!(conn_id = %conn_id, event = name, error = %err, "socket 事件因内部错误失败");
                SocketReply::internal(name)
            }
        },
    }
}
