//! Concrete identity provider backends.

pub mod supabase;

pub use supabase::SupabaseAuth;
