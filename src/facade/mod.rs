pub mod database;

pub use database::TallyDb;
