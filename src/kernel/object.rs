//! Kernel objects
//!
//! Every stream a process can name through a descriptor is a kernel object:
//! one end of a pipe, or a socket. Descriptors hold handles into the global
//! `ObjectTable`; handles are reference counted so a forked descriptor table
//! keeps the stream alive until the last holder closes it.

use super::executor::Executor;
use super::pipe::Pipe;
use super::socket::{PortMap, Socket};
use super::syscall::{SyscallError, SyscallResult};
use slab::Slab;
use std::rc::Rc;

/// Index of an object in the object table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub usize);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "handle:{}", self.0)
    }
}

/// A kernel object - anything a descriptor can point at
#[derive(Debug, Clone)]
pub enum KernelObject {
    /// Read end of a pipe
    PipeReader(Rc<Pipe>),
    /// Write end of a pipe
    PipeWriter(Rc<Pipe>),
    /// A socket in any role
    Socket(Rc<Socket>),
}

impl KernelObject {
    /// Read from this object
    pub async fn read(&self, exec: &Executor, buf: &mut [u8]) -> SyscallResult<usize> {
        match self {
            KernelObject::PipeReader(pipe) => Ok(pipe.read(exec, buf).await?),
            KernelObject::PipeWriter(_) => Err(SyscallError::BadFd),
            KernelObject::Socket(sock) => sock.read(exec, buf).await,
        }
    }

    /// Write to this object
    pub async fn write(&self, exec: &Executor, data: &[u8]) -> SyscallResult<usize> {
        match self {
            KernelObject::PipeWriter(pipe) => Ok(pipe.write(exec, data).await?),
            KernelObject::PipeReader(_) => Err(SyscallError::BadFd),
            KernelObject::Socket(sock) => sock.write(exec, data).await,
        }
    }

    /// Final close, run when the last descriptor referring to the object goes
    pub fn close(self, ports: &mut PortMap) -> SyscallResult<()> {
        match self {
            KernelObject::PipeReader(pipe) => {
                pipe.close_reader()?;
                Ok(())
            }
            KernelObject::PipeWriter(pipe) => {
                pipe.close_writer()?;
                Ok(())
            }
            KernelObject::Socket(sock) => {
                sock.close(ports);
                Ok(())
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            KernelObject::PipeReader(_) => "pipe-reader",
            KernelObject::PipeWriter(_) => "pipe-writer",
            KernelObject::Socket(_) => "socket",
        }
    }
}

/// An entry in the object table with reference count
#[derive(Debug)]
struct ObjectEntry {
    object: KernelObject,
    refcount: usize,
}

/// The object table - maps handles to reference-counted objects
///
/// Reference counting rules:
/// - insert() creates an object with refcount 1
/// - retain() increments refcount (a descriptor table was copied)
/// - release() decrements refcount, removes the object when it reaches 0
#[derive(Debug, Default)]
pub struct ObjectTable {
    objects: Slab<ObjectEntry>,
}

impl ObjectTable {
    pub fn new() -> Self {
        Self {
            objects: Slab::new(),
        }
    }

    /// Insert a new object and return its handle (refcount starts at 1)
    pub fn insert(&mut self, object: KernelObject) -> Handle {
        Handle(self.objects.insert(ObjectEntry {
            object,
            refcount: 1,
        }))
    }

    /// Increment the reference count. False if the handle is stale.
    pub fn retain(&mut self, handle: Handle) -> bool {
        match self.objects.get_mut(handle.0) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// Decrement the reference count.
    ///
    /// Returns the object once its count reaches 0; the caller must close it.
    pub fn release(&mut self, handle: Handle) -> Option<KernelObject> {
        let entry = self.objects.get_mut(handle.0)?;
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            Some(self.objects.remove(handle.0).object)
        } else {
            None
        }
    }

    pub fn refcount(&self, handle: Handle) -> usize {
        self.objects
            .get(handle.0)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    pub fn get(&self, handle: Handle) -> Option<&KernelObject> {
        self.objects.get(handle.0).map(|e| &e.object)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.objects.contains(handle.0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
