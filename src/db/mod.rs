pub mod inbox;
pub mod outbox;
