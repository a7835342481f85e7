//! Stored event callbacks, their results, and the subscriber that runs them.

pub mod dispatcher;
pub mod models;
pub mod store;

pub use dispatcher::CallbackDispatcher;
pub use models::{
    CreateEventCallbackRequest, EventCallback, EventCallbackPage, EventCallbackProcessor,
    EventCallbackQuery, EventCallbackResult, EventCallbackResultPage, EventCallbackResultQuery,
    EventCallbackResultSortOrder, EventCallbackResultStatus, EventCallbackStatus,
    UpdateEventCallbackRequest,
};
pub use store::CallbackStore;
