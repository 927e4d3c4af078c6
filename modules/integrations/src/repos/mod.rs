pub mod credential_repo;
pub mod fulfillment_repo;
pub mod item_map_repo;
pub mod message_repo;
pub mod organization_repo;
