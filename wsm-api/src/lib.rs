pub mod api_docs;
pub mod background;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use background::{start_background_tasks, BackgroundTasks, LoggingStopHandler};
pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_app;
pub use state::AppState;
