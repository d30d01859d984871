pub mod connections;
pub mod events;
pub mod matching;
pub mod messaging;
pub mod users;

pub use connections::ConnectionService;
pub use events::{EventInput, EventPatch, EventService};
pub use matching::{AiProvider, HttpAiProvider, MatchService};
pub use messaging::{MeetingInput, MessagingService};
pub use users::{ProfileInput, UserService};
