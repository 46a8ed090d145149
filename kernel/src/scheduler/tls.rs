/*
 * Thread-Local Storage
 *
 * Every loaded module that declares thread-local data gets one block per
 * thread, copied from the module's template: the initialized image followed
 * by zeroed space. Blocks are created on first use.
 */

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;

use super::thread::Thread;

/// Initial contents of a module's thread-local block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsTemplate {
    image: Arc<[u8]>,
    size: usize,
}

impl TlsTemplate {
    /// `init` is copied to the front of every block, followed by
    /// `uninit_size` zero bytes
    pub fn new(init: &[u8], uninit_size: usize) -> Self {
        Self {
            image: Arc::from(init),
            size: init.len() + uninit_size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    fn instantiate(&self) -> Box<[u8]> {
        let mut block = vec![0u8; self.size].into_boxed_slice();
        block[..self.image.len()].copy_from_slice(&self.image);
        block
    }
}

impl Thread {
    /// Create the block of `module` if the thread does not have it yet
    pub fn setup_tls(&self, module: usize, template: &TlsTemplate) {
        self.with_tls_init(module, template, |_| ());
    }

    pub fn has_tls(&self, module: usize) -> bool {
        self.tls.lock().get(module).is_some_and(Option::is_some)
    }

    /// Access the block of `module`, if it was set up
    pub fn with_tls<R>(&self, module: usize, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut tls = self.tls.lock();
        let block = tls.get_mut(module)?.as_mut()?;
        Some(f(block))
    }

    /// Access the block of `module`, creating it from `template` first
    pub fn with_tls_init<R>(
        &self,
        module: usize,
        template: &TlsTemplate,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> R {
        let mut tls = self.tls.lock();
        if tls.len() <= module {
            tls.resize_with(module + 1, || None);
        }
        f(tls[module].get_or_insert_with(|| template.instantiate()))
    }
}
