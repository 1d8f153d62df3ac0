pub mod acquisition;
pub mod appstate;
pub mod camera;
pub mod channel;
pub mod config;
pub mod control;
pub mod events;
pub mod forwarding_task;
pub mod hardware;
pub mod http;
pub mod system;
pub mod worker;
