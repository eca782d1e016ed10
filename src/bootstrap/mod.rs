mod server;
mod shutdown;
mod state;

pub use server::Server;
pub use shutdown::{wait_for_signal, Shutdown, ShutdownState};
pub use state::AppState;
