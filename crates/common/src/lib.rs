// huddle-common: wire protocol and shared types for the Huddle real-time relay

pub mod protocol;
pub mod types;
