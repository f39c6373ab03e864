pub mod error;
pub mod frame;
pub mod message;

pub use error::{ErrorCode, WireError};
pub use frame::{FrameCodec, MAX_FRAME_LEN};
pub use message::{
    parse_frame, CapabilityClaim, DecodedFrame, Envelope, ErrorBody, GroupChange, GroupGroupsAck,
    GroupPodsAck, GroupQuery, HeartbeatAck, Message, NodeHeartbeat, NodeRegisterAck, NodeView,
    PodAssignment, PodIdentify, PodRef, PodStatusReport, PodTerminate, RegisterNode, ResourceSpec,
    RouteRequest, RouteResponse,
};
