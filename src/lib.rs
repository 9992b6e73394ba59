pub mod config;
pub mod error;
pub mod fs;
pub mod logging;
pub mod retry;
pub mod storage;
pub mod utils;

// Driver modules (point to project root drivers via path attribute) / 驱动模块
#[path = "../drivers/mod.rs"]
pub mod drivers;

pub use error::{Result, TosfsError};
pub use fs::TosFileSystem;
pub use storage::{FileSystem, FsRegistry};

// Register all filesystem factories (call unified registration function from drivers module) / 注册所有文件系统工厂
pub async fn register_filesystems(registry: &FsRegistry) -> anyhow::Result<()> {
    drivers::register_all(registry).await
}
