pub mod app;
pub mod message;
pub mod socket;

pub use app::{is_presence_channel, App};
pub use message::{PusherMessage, DRAIN_CODE, TERMINATION_CODE};
pub use socket::{Outbound, PresenceMember, Socket, SocketSender, User};
