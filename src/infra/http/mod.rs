mod middleware;
mod public;

pub use middleware::{REQUEST_ID_HEADER, RequestContext, VerseOutcome};
pub use public::{HttpState, build_router};
