//! Mount lifecycle
//!
//! `Init -> Mounted -> Serving -> Closed`. Mounting bind-mounts the
//! target's parent into a private temporary directory before the FUSE
//! session covers the target, so passthrough nodes keep reaching the real
//! files underneath the overlay.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use fuser::{MountOption, Session, SessionUnmounter};
use nix::mount::{mount, umount, MsFlags};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::filesystem::OverlayFs;
use super::overlay::{Inspector, Overlay};
use crate::config::Config;
use crate::error::{Error, Result};

struct Mounted {
    target: PathBuf,
    bind_dir: PathBuf,
    /// Taken by `serve`
    session: Option<Session<OverlayFs>>,
    unmounter: SessionUnmounter,
    serve_thread: Option<JoinHandle<()>>,
}

/// Owns the overlay and its kernel mount
pub struct Engine {
    config: Config,
    overlay: Arc<Overlay>,
    mounted: Option<Mounted>,
}

impl Engine {
    /// Build the overlay with an owned root and the given inspector
    pub fn init(config: Config, inspector: Arc<dyn Inspector>, runtime: Handle) -> Result<Self> {
        config.validate()?;
        // The backing root is set once the bind mount exists
        let overlay = Overlay::new(&config, PathBuf::new(), inspector, runtime)?;

        Ok(Self {
            config,
            overlay,
            mounted: None,
        })
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted.is_some()
    }

    /// Temporary directory holding the bind mount, while mounted
    pub fn bind_dir(&self) -> Option<&Path> {
        self.mounted.as_ref().map(|m| m.bind_dir.as_path())
    }

    /// Backing path for a path relative to the mount point
    pub fn real_path(&self, relative: &Path) -> PathBuf {
        self.overlay.real_path(relative)
    }

    fn mount_options(&self) -> Vec<MountOption> {
        let mount = &self.config.mount;
        let mut options = vec![MountOption::FSName(mount.fs_name.clone())];

        if mount.allow_other {
            options.push(MountOption::AllowOther);
        }
        if mount.default_permissions {
            options.push(MountOption::DefaultPermissions);
        }
        if mount.allow_non_empty {
            options.push(MountOption::CUSTOM("nonempty".to_string()));
        }
        options
    }

    /// Mount the overlay on `target`
    pub fn mount(&mut self, target: &Path) -> Result<()> {
        if self.mounted.is_some() {
            return Err(Error::Lifecycle("already mounted"));
        }

        let target = target.canonicalize()?;
        let (parent, name) = match (target.parent(), target.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_os_string()),
            _ => {
                return Err(Error::Mount(format!(
                    "cannot mount over {}",
                    target.display()
                )))
            }
        };

        let bind_dir = env::temp_dir().join(format!(
            "{}{}",
            self.config.mount.bind_dir_prefix,
            Uuid::new_v4()
        ));
        fs::create_dir(&bind_dir)?;

        if let Err(e) = bind_private(&parent, &bind_dir) {
            remove_bind_dir(&bind_dir);
            return Err(e);
        }
        debug!("bound {} at {}", parent.display(), bind_dir.display());

        let fs = OverlayFs::new(self.overlay.clone());
        let mut session = match Session::new(fs, &target, &self.mount_options()) {
            Ok(session) => session,
            Err(e) => {
                unbind(&bind_dir);
                return Err(Error::Mount(format!("{}: {}", target.display(), e)));
            }
        };
        let unmounter = session.unmount_callable();
        // Requests are only dispatched once `serve` runs the session
        self.overlay.set_backing_root(bind_dir.join(&name));

        info!(
            "mounted {} (backing {})",
            target.display(),
            bind_dir.join(&name).display()
        );
        self.mounted = Some(Mounted {
            target,
            bind_dir,
            session: Some(session),
            unmounter,
            serve_thread: None,
        });
        Ok(())
    }

    /// Start dispatching requests on a dedicated thread. The outcome of the
    /// serve loop is sent on `result_tx` when it ends.
    pub fn serve(&mut self, result_tx: oneshot::Sender<Result<()>>) -> Result<()> {
        let mounted = self
            .mounted
            .as_mut()
            .ok_or(Error::Lifecycle("serve called before mount"))?;
        let mut session = mounted
            .session
            .take()
            .ok_or(Error::Lifecycle("already serving"))?;

        let thread = thread::Builder::new()
            .name("quarantinefs-serve".to_string())
            .spawn(move || {
                let result = session.run().map_err(Error::Io);
                if let Err(e) = &result {
                    error!("serve loop failed: {}", e);
                }
                let _ = result_tx.send(result);
            })?;

        mounted.serve_thread = Some(thread);
        info!("serving {}", mounted.target.display());
        Ok(())
    }

    /// Unmount everything, reporting every failure
    pub fn close(&mut self) -> Result<()> {
        let mut mounted = self
            .mounted
            .take()
            .ok_or(Error::Lifecycle("close called before mount"))?;
        let mut errors = Vec::new();

        let pending = self.overlay.pending();
        if pending > 0 {
            warn!("{} file(s) were never flushed and are discarded", pending);
        }

        if let Err(e) = mounted.unmounter.unmount() {
            errors.push(Error::Unmount(format!(
                "{}: {}",
                mounted.target.display(),
                e
            )));
        }
        if let Some(thread) = mounted.serve_thread.take() {
            if thread.join().is_err() {
                errors.push(Error::Internal("serve thread panicked".to_string()));
            }
        }
        drop(mounted.session.take());

        if let Err(e) = umount(&mounted.bind_dir) {
            errors.push(Error::Unmount(format!(
                "{}: {}",
                mounted.bind_dir.display(),
                e
            )));
        }
        if let Err(e) = fs::remove_dir(&mounted.bind_dir) {
            errors.push(Error::Io(e));
        }

        if errors.is_empty() {
            info!("unmounted {}", mounted.target.display());
        }
        Error::aggregate(errors)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.mounted.is_some() {
            if let Err(e) = self.close() {
                error!("failed to close engine on drop: {}", e);
            }
        }
    }
}

/// Bind `source` onto `target` and make the new mount private
fn bind_private(source: &Path, target: &Path) -> Result<()> {
    mount(
        Some(source),
        target,
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| {
        Error::Mount(format!(
            "bind {} -> {}: {}",
            source.display(),
            target.display(),
            e
        ))
    })?;

    if let Err(e) = mount(
        None::<&str>,
        target,
        None::<&str>,
        MsFlags::MS_PRIVATE,
        None::<&str>,
    ) {
        if let Err(undo) = umount(target) {
            warn!("failed to undo bind mount {}: {}", target.display(), undo);
        }
        return Err(Error::Mount(format!(
            "make {} private: {}",
            target.display(),
            e
        )));
    }
    Ok(())
}

/// Undo a completed bind mount during a failed mount
fn unbind(bind_dir: &Path) {
    if let Err(e) = umount(bind_dir) {
        warn!("failed to unmount {}: {}", bind_dir.display(), e);
        return;
    }
    remove_bind_dir(bind_dir);
}

/// Remove the (empty) bind directory; never recursive
fn remove_bind_dir(bind_dir: &Path) {
    if let Err(e) = fs::remove_dir(bind_dir) {
        warn!("failed to remove {}: {}", bind_dir.display(), e);
    }
}
