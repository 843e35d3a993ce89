pub mod error;
pub mod events;
pub mod models;

pub use error::{DmError, ErrorKind};
pub use events::{AckData, GatewayCommand, GatewayEvent};
pub use models::{
    ChannelKind, Claims, DmChannel, Message, MessageState, ReactionGroup, ReadReceipt,
};
