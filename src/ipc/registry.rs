use std::{collections::HashMap, sync::Arc};

use crate::{
    error::{Result, SupervisorError},
    ipc::{master::Responder, message::IpcMessage},
};

/// Handler invoked with the inbound request and a one-shot responder.
/// Dropping the responder without answering is a fire-and-forget reply.
pub type MethodFn = dyn Fn(&IpcMessage, Responder) + Send + Sync;

/// Static `(name, handler)` list exported by each handler module.
pub type MethodList = Vec<(&'static str, Arc<MethodFn>)>;

/// Checks that `name` is a dot-separated list of identifiers
/// (`statistics.crashes`, `logger.log`, `shutdown`).
pub fn validate_method_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('.').all(|segment| {
            let mut chars = segment.chars();
            match chars.next() {
                Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                }
                _ => false,
            }
        });

    if valid {
        Ok(())
    } else {
        Err(SupervisorError::InvalidArgument(format!(
            "method name {:?} is not a dotted identifier",
            name
        )))
    }
}

/// Binds a plain function to its receiver, yielding a registrable handler.
pub fn bind<R>(receiver: Arc<R>, method: fn(&R, &IpcMessage, Responder)) -> Arc<MethodFn>
where
    R: Send + Sync + 'static,
{
    Arc::new(move |message: &IpcMessage, responder: Responder| {
        method(&receiver, message, responder)
    })
}

#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<MethodFn>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_method<F>(&mut self, name: &str, handler: F) -> Result<()>
    where
        F: Fn(&IpcMessage, Responder) + Send + Sync + 'static,
    {
        self.insert(name, Arc::new(handler))
    }

    /// Registers `method` bound to a shared receiver.
    pub fn add_receiver_method<R>(
        &mut self,
        name: &str,
        receiver: Arc<R>,
        method: fn(&R, &IpcMessage, Responder),
    ) -> Result<()>
    where
        R: Send + Sync + 'static,
    {
        self.insert(name, bind(receiver, method))
    }

    pub fn extend(&mut self, methods: MethodList) -> Result<()> {
        for (name, handler) in methods {
            self.insert(name, handler)?;
        }
        Ok(())
    }

    pub fn insert(&mut self, name: &str, handler: Arc<MethodFn>) -> Result<()> {
        validate_method_name(name)?;
        self.methods.insert(name.to_owned(), handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<MethodFn>> {
        self.methods.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
