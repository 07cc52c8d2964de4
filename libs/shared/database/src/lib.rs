pub mod filter;
pub mod memory;
pub mod store;
pub mod supabase;

pub use filter::Filter;
pub use memory::MemoryStore;
pub use store::{ChangeType, DocumentChange, DocumentStream, SignalingStore, StoreError};
pub use supabase::SupabaseClient;
