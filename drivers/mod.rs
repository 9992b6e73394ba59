// Driver package / 驱动包
pub mod memory;
pub mod tos;

use crate::storage::FsRegistry;

/// Register all filesystem factories / 注册所有文件系统工厂
pub async fn register_all(registry: &FsRegistry) -> anyhow::Result<()> {
    // Register TOS driver / 注册TOS对象存储驱动
    registry.register_factory(Box::new(tos::TosFsFactory)).await?;
    // Register in-process driver / 注册内存驱动
    registry.register_factory(Box::new(memory::MemoryFsFactory)).await?;
    Ok(())
}
