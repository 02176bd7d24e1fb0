pub mod cursor;
pub mod io;
pub mod modification;
pub mod prolly_tree;

pub use cursor::Cursor;
pub use modification::{Mutation, Update};
pub use prolly_tree::{ProllyTree, SearchResult};
