pub mod channels;
pub mod consume_logs;
pub mod tokens;
pub mod users;

pub use channels::Entity as Channels;
pub use consume_logs::Entity as ConsumeLogs;
pub use tokens::Entity as Tokens;
pub use users::Entity as Users;
