//! Variables
//!
//! The four variable kinds share one 32-bit ID space with the kind in the
//! high nibble. Locals live in the control flow's buffer and are not stored
//! here; the other three kinds are owned by their module:
//!
//! - global: one 8-byte-aligned slot in the runtime's static memory block
//! - user-defined: host getter/setter working through the value stack
//! - external: a live i64 cell shared with host memory

use std::fmt;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use lemon_core::{AnyBaseValue, DataTypeRef, FlyweightString, VariableInfo, VariableKind};

use crate::exec::ExecContext;

/// Host callback for user-defined variables; getters push onto the value
/// stack, setters pop from it.
pub type UserVariableCallback = Arc<dyn Fn(&mut ExecContext<'_>) + Send + Sync>;

/// Host callback yielding the live cell of an external variable. Reads and
/// writes go through that cell directly.
pub type ExternalVariableAccessor = Arc<dyn Fn() -> Arc<AtomicI64> + Send + Sync>;

pub enum VariablePayload {
    Global {
        initial_value: AnyBaseValue,
    },
    User {
        getter: UserVariableCallback,
        setter: UserVariableCallback,
    },
    External {
        accessor: ExternalVariableAccessor,
    },
}

/// A module-owned variable (global, user-defined, or external).
pub struct Variable {
    pub info: VariableInfo,
    pub payload: VariablePayload,
}

impl Variable {
    pub fn id(&self) -> u32 {
        self.info.id
    }

    pub fn name(&self) -> &FlyweightString {
        &self.info.name
    }

    pub fn data_type(&self) -> &DataTypeRef {
        &self.info.data_type
    }

    pub fn kind(&self) -> VariableKind {
        self.info.kind()
    }

    pub fn initial_value(&self) -> AnyBaseValue {
        match &self.payload {
            VariablePayload::Global { initial_value } => *initial_value,
            _ => AnyBaseValue::new(),
        }
    }

    pub fn set_initial_value(&mut self, value: AnyBaseValue) {
        if let VariablePayload::Global { initial_value } = &mut self.payload {
            *initial_value = value;
        }
    }

    pub fn user_getter(&self) -> Option<&UserVariableCallback> {
        match &self.payload {
            VariablePayload::User { getter, .. } => Some(getter),
            _ => None,
        }
    }

    pub fn user_setter(&self) -> Option<&UserVariableCallback> {
        match &self.payload {
            VariablePayload::User { setter, .. } => Some(setter),
            _ => None,
        }
    }

    /// The live cell of an external variable.
    pub fn external_cell(&self) -> Option<Arc<AtomicI64>> {
        match &self.payload {
            VariablePayload::External { accessor } => Some(accessor()),
            _ => None,
        }
    }
}

impl fmt::Debug for Variable {
    // Callbacks are not printable; show the identity fields only.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("id", &self.info.id)
            .field("name", &self.info.name)
            .field("kind", &self.info.kind())
            .finish_non_exhaustive()
    }
}
