pub mod app;
pub mod library;
pub mod solver;

pub use app::App;
