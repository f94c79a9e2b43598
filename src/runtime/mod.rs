//! Модуль, содержащий исполнительную среду для ASG.
//!
//! `backend` задает интерфейс бэкенда, `cpu_backend` - его реализацию на
//! `ndarray`, а `session` хранит значения переменных между запусками.

pub mod backend;
pub mod cpu_backend;
pub mod session;

pub use session::Session;
