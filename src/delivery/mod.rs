//! Outbound delivery of resolved voice notes.

pub mod adapter;
pub mod gateway;

pub use adapter::{
    normalize_channel_address, strip_provenance_markup, DeliveryAdapter, DeliveryRequest,
};
pub use gateway::{
    GatewayError, GatewayReceipt, MessagingGateway, OutboundMessage, TwilioGateway,
};
