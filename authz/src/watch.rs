//! Change notifications for a single file.
//!
//! Editors and config-map mounts often replace a file instead of writing it
//! in place. The watch then follows the old inode, so callers re-add the
//! path after `Remove` or `Rename` events.

use std::path::PathBuf;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileEventKind {
    Write,
    Create,
    Remove,
    Rename,
    Chmod,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

impl FileEvent {
    pub fn replaces_file(&self) -> bool {
        matches!(self.kind, FileEventKind::Remove | FileEventKind::Rename)
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::{FileEvent, FileEventKind};
    use futures_util::StreamExt;
    use inotify::{EventMask, EventStream, Inotify, WatchDescriptor, WatchMask};
    use std::io;
    use std::path::{Path, PathBuf};

    pub struct FileWatcher {
        events: EventStream<Vec<u8>>,
        watch: Option<(PathBuf, WatchDescriptor)>,
    }

    fn kind_of(mask: EventMask) -> Option<FileEventKind> {
        if mask.intersects(EventMask::DELETE_SELF | EventMask::DELETE) {
            Some(FileEventKind::Remove)
        } else if mask.intersects(EventMask::MOVE_SELF | EventMask::MOVED_FROM) {
            Some(FileEventKind::Rename)
        } else if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
            Some(FileEventKind::Create)
        } else if mask.intersects(EventMask::MODIFY | EventMask::CLOSE_WRITE) {
            Some(FileEventKind::Write)
        } else if mask.contains(EventMask::ATTRIB) {
            Some(FileEventKind::Chmod)
        } else {
            None
        }
    }

    impl FileWatcher {
        pub fn new() -> io::Result<Self> {
            let inotify = Inotify::init()?;
            let events = inotify.into_event_stream(vec![0u8; 4096])?;
            Ok(Self {
                events,
                watch: None,
            })
        }

        pub fn add(&mut self, path: &Path) -> io::Result<()> {
            let mask = WatchMask::MODIFY
                | WatchMask::CLOSE_WRITE
                | WatchMask::ATTRIB
                | WatchMask::DELETE_SELF
                | WatchMask::MOVE_SELF;
            let wd = self.events.watches().add(path, mask)?;
            self.watch = Some((path.to_path_buf(), wd));
            Ok(())
        }

        /// The kernel drops the watch on its own once the inode is gone, so
        /// an error here is expected after `Remove`.
        pub fn remove(&mut self) -> io::Result<()> {
            match self.watch.take() {
                Some((_, wd)) => self.events.watches().remove(wd),
                None => Ok(()),
            }
        }

        pub async fn next_event(&mut self) -> Option<io::Result<FileEvent>> {
            loop {
                let event = match self.events.next().await? {
                    Ok(event) => event,
                    Err(err) => return Some(Err(err)),
                };
                let Some((path, wd)) = &self.watch else {
                    continue;
                };
                if event.wd != *wd {
                    continue;
                }
                if let Some(kind) = kind_of(event.mask) {
                    return Some(Ok(FileEvent {
                        path: path.clone(),
                        kind,
                    }));
                }
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::FileEvent;
    use std::io;
    use std::path::Path;

    pub struct FileWatcher {
        _private: (),
    }

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "file watching is only supported on linux",
        )
    }

    impl FileWatcher {
        pub fn new() -> io::Result<Self> {
            Err(unsupported())
        }

        pub fn add(&mut self, _path: &Path) -> io::Result<()> {
            Err(unsupported())
        }

        pub fn remove(&mut self) -> io::Result<()> {
            Ok(())
        }

        pub async fn next_event(&mut self) -> Option<io::Result<FileEvent>> {
            None
        }
    }
}

pub use imp::FileWatcher;
