// モジュールの公開と型の再エクスポート
pub mod dao_impl;
pub mod dao_trait;
mod process;
pub mod types;
mod work;

pub use dao_impl::SqliteWorkDao;
pub use dao_trait::{WorkDao, WorkMutation, mutation};
pub use types::WorkStatus;
