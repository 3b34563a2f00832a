pub mod addr;
pub mod buf;
pub mod error;
pub mod pipe;
pub mod stream;

pub use addr::Address;
pub use buf::MultiBuffer;
pub use error::Error;
pub use stream::ProxyStream;
