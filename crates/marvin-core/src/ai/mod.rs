pub mod cancel;
pub mod openai;
pub mod stream;

pub use cancel::CancellationHandle;
pub use openai::{ChatClient, UnexpectedRolePolicy};
pub use stream::ChatStream;
