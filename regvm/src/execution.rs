use std::sync::Arc;

use crate::{Method, Module, RegisterFile, Throwable};

/// One activation: the method being run, its module for constant and
/// method lookups, the program counter and its own registers.
#[derive(Debug)]
pub struct Frame {
    pub module: Arc<Module>,
    pub method: Arc<Method>,
    pub pc: usize,
    pub registers: RegisterFile,
}

impl Frame {
    pub fn new(module: Arc<Module>, method: Arc<Method>) -> Self {
        let registers = RegisterFile::new(method.registers as usize);
        Self {
            module,
            method,
            pc: 0,
            registers,
        }
    }
}

#[derive(Debug)]
pub struct ExecutionState {
    pub frames: Vec<Frame>,
    /// result of the last invoke, read by `move-result`
    pub retval: u64,
    /// exception delivered to the current catch handler
    pub exception: Option<Throwable>,
    pub max_frames: usize,
}

#[derive(Debug, Clone)]
pub struct ExecutionStateCreateInfo {
    pub max_frames: usize,
}

impl Default for ExecutionStateCreateInfo {
    fn default() -> Self {
        Self { max_frames: 1024 }
    }
}

impl ExecutionState {
    pub fn new(info: &ExecutionStateCreateInfo) -> Self {
        Self {
            frames: Vec::with_capacity(info.max_frames.min(64)),
            retval: 0,
            exception: None,
            max_frames: info.max_frames,
        }
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), Throwable> {
        if self.frames.len() >= self.max_frames {
            return Err(Throwable::with_message(
                crate::ThrowableKind::StackOverflow,
                format!("{} frames", self.frames.len()),
            ));
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    #[inline]
    pub fn current(&mut self) -> Option<&mut Frame> {
        self.frames.last_mut()
    }
}
