//! Shared test transport: records emissions, fails on demand.

use std::cell::RefCell;
use std::rc::Rc;

use sockq::{EmitDescriptor, Transport, TransportError};

#[derive(Default)]
pub struct ScriptedTransport {
    emits: RefCell<Vec<EmitDescriptor>>,
    fail_with: RefCell<Option<String>>,
}

impl ScriptedTransport {
    pub fn shared() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn emit_count(&self) -> usize {
        self.emits.borrow().len()
    }

    pub fn emits(&self) -> Vec<EmitDescriptor> {
        self.emits.borrow().clone()
    }

    /// Make subsequent `emit` calls fail with `reason`.
    pub fn fail(&self, reason: &str) {
        *self.fail_with.borrow_mut() = Some(reason.to_owned());
    }

    /// Let subsequent `emit` calls succeed again.
    pub fn heal(&self) {
        self.fail_with.borrow_mut().take();
    }
}

impl Transport for ScriptedTransport {
    fn emit(&self, emit: &EmitDescriptor) -> Result<(), TransportError> {
        if let Some(reason) = self.fail_with.borrow().clone() {
            return Err(TransportError::new(reason));
        }
        self.emits.borrow_mut().push(emit.clone());
        Ok(())
    }
}
