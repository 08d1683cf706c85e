//! Viewer peer connection over `webrtc`

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::source::H264Source;
use crate::registry::ChannelId;
use crate::signaling::{
    EngineError, IceCandidate, PeerConnection, PeerEvent, PeerState, SessionDescription,
};

/// One viewer's peer connection with a single outgoing video track
pub struct RtcPeer {
    channel: ChannelId,
    connection: Arc<RTCPeerConnection>,
    track: Arc<TrackLocalStaticSample>,
    source: Arc<H264Source>,
}

impl RtcPeer {
    pub(super) async fn connect(
        api: &API,
        config: RTCConfiguration,
        channel: ChannelId,
        source: Arc<H264Source>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Self, EngineError> {
        let connection = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| EngineError::Peer(e.to_string()))?,
        );

        let track = source.attach().await;
        let sender = match connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                source.detach(&track).await;
                let _ = connection.close().await;
                return Err(EngineError::Peer(e.to_string()));
            }
        };

        // Drain RTCP so interceptors run; a PLI asks the encoder for an IDR
        let rtcp_source = Arc::clone(&source);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while let Ok((packets, _)) = sender.read(&mut buf).await {
                let lost = packets
                    .iter()
                    .any(|p| p.as_any().downcast_ref::<PictureLossIndication>().is_some());
                if lost {
                    rtcp_source.request_keyframe();
                }
            }
        });

        let candidate_events = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                            username_fragment: init.username_fragment,
                        }));
                    }
                    Err(e) => tracing::debug!(error = %e, "Local candidate not serializable"),
                }
            })
        }));

        let state_events = events;
        connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    let mapped = match state {
                        RTCPeerConnectionState::New => PeerState::New,
                        RTCPeerConnectionState::Connecting => PeerState::Connecting,
                        RTCPeerConnectionState::Connected => PeerState::Connected,
                        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerState::Failed,
                        RTCPeerConnectionState::Closed => PeerState::Closed,
                        _ => return,
                    };
                    let _ = events.send(PeerEvent::StateChanged(mapped));
                })
            },
        ));

        Ok(Self {
            channel,
            connection,
            track,
            source,
        })
    }
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, EngineError> {
        let offer = RTCSessionDescription::offer(offer.sdp)
            .map_err(|e| EngineError::Negotiation(format!("invalid offer: {}", e)))?;

        self.connection
            .set_remote_description(offer)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        let answer = self
            .connection
            .create_answer(None)
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(|e| EngineError::Negotiation(e.to_string()))?;

        tracing::debug!(channel = %self.channel, "Local description set");
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| EngineError::Candidate(e.to_string()))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.source.detach(&self.track).await;
        self.connection
            .close()
            .await
            .map_err(|e| EngineError::Peer(e.to_string()))
    }
}
