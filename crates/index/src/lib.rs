pub mod debounce;
pub mod scanner;
pub mod watcher;

pub use debounce::{DebounceConfig, DebouncedWatcher};
pub use scanner::{EventFilter, Scanner, decode_text};
pub use watcher::{ChangeKind, FileChange, WatchError, WatchEvent, Watcher};
