#![forbid(unsafe_code)]

// HTTP RPC surface for media negotiation

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::config::IceServer;
use crate::engine::types::{DtlsParameters, MediaKind, ProducerId, RtpCapabilities, RtpParameters};
use crate::error::SignalError;
use crate::room::peer::Direction;
use crate::room::{ConsumerInfo, RoomStats, TransportInfo};
use crate::signaling::SignalingServer;

pub fn router() -> Router<SignalingServer> {
    Router::new()
        .route("/api/rooms/{room_id}/capabilities", get(capabilities))
        .route(
            "/api/rooms/{room_id}/peers/{peer_id}/transports",
            post(create_transport),
        )
        .route(
            "/api/rooms/{room_id}/peers/{peer_id}/transports/connect",
            post(connect_transport),
        )
        .route("/api/rooms/{room_id}/peers/{peer_id}/produce", post(produce))
        .route("/api/rooms/{room_id}/peers/{peer_id}/consume", post(consume))
        .route("/api/rooms/{room_id}/stats", get(stats))
}

#[derive(Serialize)]
pub struct CapabilitiesResponse {
    pub capabilities: RtpCapabilities,
}

#[derive(Deserialize)]
pub struct CreateTransportRequest {
    pub direction: Direction,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportResponse {
    #[serde(flatten)]
    pub transport: TransportInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ice_servers: Vec<IceServer>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest {
    pub direction: Direction,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceResponse {
    pub producer_id: ProducerId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub producer_id: ProducerId,
    pub rtp_capabilities: RtpCapabilities,
}

/// GET /api/rooms/{roomId}/capabilities
async fn capabilities(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> Result<Json<CapabilitiesResponse>, SignalError> {
    let capabilities = server.manager().capabilities(&room_id).await?;
    Ok(Json(CapabilitiesResponse { capabilities }))
}

/// POST /api/rooms/{roomId}/peers/{peerId}/transports
async fn create_transport(
    State(server): State<SignalingServer>,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(request): Json<CreateTransportRequest>,
) -> Result<Json<CreateTransportResponse>, SignalError> {
    let transport = server
        .manager()
        .create_transport(&room_id, &peer_id, request.direction)
        .await?;
    let ice_servers = server
        .turn()
        .map(|turn| turn.ice_servers(&peer_id))
        .unwrap_or_default();
    Ok(Json(CreateTransportResponse {
        transport,
        ice_servers,
    }))
}

/// POST /api/rooms/{roomId}/peers/{peerId}/transports/connect
async fn connect_transport(
    State(server): State<SignalingServer>,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(request): Json<ConnectTransportRequest>,
) -> Result<Json<OkResponse>, SignalError> {
    server
        .manager()
        .connect_transport(&room_id, &peer_id, request.direction, request.dtls_parameters)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

/// POST /api/rooms/{roomId}/peers/{peerId}/produce
async fn produce(
    State(server): State<SignalingServer>,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(request): Json<ProduceRequest>,
) -> Result<Json<ProduceResponse>, SignalError> {
    let producer_id = server
        .manager()
        .produce(&room_id, &peer_id, request.kind, request.rtp_parameters)
        .await?;
    Ok(Json(ProduceResponse { producer_id }))
}

/// POST /api/rooms/{roomId}/peers/{peerId}/consume
async fn consume(
    State(server): State<SignalingServer>,
    Path((room_id, peer_id)): Path<(String, String)>,
    Json(request): Json<ConsumeRequest>,
) -> Result<Json<ConsumerInfo>, SignalError> {
    let info = server
        .manager()
        .consume(&room_id, &peer_id, request.producer_id, request.rtp_capabilities)
        .await?;
    Ok(Json(info))
}

/// GET /api/rooms/{roomId}/stats
async fn stats(
    State(server): State<SignalingServer>,
    Path(room_id): Path<String>,
) -> Result<Json<RoomStats>, SignalError> {
    let stats = server
        .manager()
        .stats(&room_id)
        .await
        .ok_or_else(|| SignalError::NotFound(format!("room {room_id} not found")))?;
    Ok(Json(stats))
}
