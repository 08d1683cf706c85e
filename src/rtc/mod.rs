//! WebRTC media engine
//!
//! Production [`MediaEngine`] built on `webrtc` with H.264 encoding by
//! `openh264`. Each channel gets one [`H264Source`]; each viewer gets an
//! [`RtcPeer`] with its own track attached to that source.

mod peer;
mod source;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;

use crate::registry::{ChannelId, Resolution};
use crate::signaling::{EngineError, MediaEngine, PeerConnection, PeerEvent, VideoSource};

pub use peer::RtcPeer;
pub use source::H264Source;

/// Default public STUN server
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// `webrtc`-backed media engine
pub struct WebRtcEngine {
    api: API,
    ice_servers: Vec<String>,
}

impl WebRtcEngine {
    /// Build the engine with default codecs and interceptors
    pub fn new(ice_servers: Vec<String>) -> Result<Self, EngineError> {
        let mut codecs = CodecRegistry::default();
        codecs
            .register_default_codecs()
            .map_err(|e| EngineError::Peer(format!("failed to register codecs: {}", e)))?;

        let interceptors = register_default_interceptors(Registry::new(), &mut codecs)
            .map_err(|e| EngineError::Peer(format!("failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(interceptors)
            .build();

        Ok(Self {
            api,
            ice_servers,
        })
    }

    fn configuration(&self) -> RTCConfiguration {
        RTCConfiguration {
            ice_servers: self
                .ice_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_source(
        &self,
        channel: &ChannelId,
        resolution: Resolution,
    ) -> Result<Arc<dyn VideoSource>, EngineError> {
        let source = H264Source::spawn(channel.clone(), resolution)?;
        Ok(source)
    }

    async fn create_peer(
        &self,
        channel: &ChannelId,
        source: Arc<dyn VideoSource>,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Box<dyn PeerConnection>, EngineError> {
        let source = source.into_any().downcast::<H264Source>().map_err(|_| {
            EngineError::Peer(format!("video source for {} is not an H.264 source", channel))
        })?;

        let peer = RtcPeer::connect(
            &self.api,
            self.configuration(),
            channel.clone(),
            source,
            events,
        )
        .await?;

        Ok(Box::new(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_lists_ice_servers() {
        let engine = WebRtcEngine::new(vec![
            DEFAULT_STUN_SERVER.to_string(),
            "stun:stun1.l.google.com:19302".to_string(),
        ])
        .unwrap();

        let config = engine.configuration();
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[0].urls, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[tokio::test]
    async fn test_peer_rejects_foreign_source() {
        let engine = WebRtcEngine::new(vec![]).unwrap();
        let (events, _rx) = mpsc::unbounded_channel();
        let channel = ChannelId::new("cam-1").unwrap();

        struct Placeholder;
        impl VideoSource for Placeholder {
            fn resolution(&self) -> Resolution {
                Resolution::new(2, 2)
            }
            fn push_frame(&self, _: &crate::registry::DecodedFrame) -> Result<(), EngineError> {
                Ok(())
            }
            fn into_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
                self
            }
        }

        let result = engine
            .create_peer(&channel, Arc::new(Placeholder), events)
            .await;
        assert!(matches!(result, Err(EngineError::Peer(_))));
    }
}
