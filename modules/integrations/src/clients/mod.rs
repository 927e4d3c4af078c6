pub mod accounting;
pub mod erp;
pub mod outbound;

pub use accounting::AccountingClient;
pub use erp::ErpClient;
pub use outbound::{AuthScheme, OutboundClient};
