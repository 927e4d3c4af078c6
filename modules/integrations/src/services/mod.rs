pub mod fulfillment_executor;
pub mod fulfillment_returns;
pub mod fulfillment_service;
pub mod gateway_settings;
pub mod invoice_sync;
pub mod line_mapper;
pub mod order_normalizer;
