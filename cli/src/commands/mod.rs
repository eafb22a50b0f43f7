pub mod chat;
pub mod conversations;
pub mod gate;
pub mod health;
pub mod prayer;
