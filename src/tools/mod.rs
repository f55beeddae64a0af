//! 工作区工具：沙箱文件系统、Shell、Web 检索与动作执行器

pub mod executor;
pub mod filesystem;
pub mod search;
pub mod shell;

pub use executor::{ActionExecutor, ActionOutcome};
pub use filesystem::{SafeFs, WriteOutcome};
pub use search::{HttpWebTools, SearchHit, WebTools};
pub use shell::{CommandOutput, CommandRunner};
