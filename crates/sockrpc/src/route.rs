//! Route registry, call-path resolver and method exposure tables.
//!
//! A registry maps route names to either a plain async function or a
//! stateful route type instantiated once per session. Which methods of a
//! stateful route are callable from the peer is decided once, at
//! registration time, by a [`MethodTableBuilder`] governed by a
//! [`MaskPolicy`]. There is no runtime reflection; lookup is a table probe.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::error::{HandlerError, RouteError};
use crate::message::Args;
use crate::session::Session;

/// Method name dispatched for a dotless call path on a stateful route.
pub const INIT_METHOD: &str = "init";

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

type RouteFn = Arc<dyn Fn(Session, Args) -> HandlerFuture + Send + Sync>;
type MethodFn<R> = Arc<dyn Fn(Arc<R>, Session, Args) -> HandlerFuture + Send + Sync>;

/// A stateful route: one instance per session, created on first dispatch and
/// retained until the session closes.
pub trait RouteHandler: Send + Sync + Sized + 'static {
    /// Build the per-session instance.
    fn attach(session: &Session) -> Self;

    /// The exposure table for this route type.
    fn methods() -> MethodTable<Self>;

    /// Called when the owning session closes.
    fn on_close(&self) {}
}

/// How a method name maps to wire visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MaskPolicy {
    /// Opt-out: everything is proxied unless masked. Leading-underscore
    /// names are implicitly masked.
    Default,
    /// Opt-in: only explicitly exposed names are proxied.
    AllowList,
    /// Only names carrying the prefix are proxied, under the stripped name.
    Prefix(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Callable from the peer under the given public name.
    Proxied(String),
    Masked,
    /// Not covered by the policy; `expose` can still proxy it.
    Unclassified,
}

impl MaskPolicy {
    pub fn classify(&self, name: &str) -> Classification {
        if name.starts_with('_') {
            return Classification::Masked;
        }
        match self {
            Self::Default => Classification::Proxied(name.to_owned()),
            Self::AllowList => Classification::Unclassified,
            Self::Prefix(prefix) => match name.strip_prefix(prefix) {
                Some(public) if !public.is_empty() => Classification::Proxied(public.to_owned()),
                _ => Classification::Unclassified,
            },
        }
    }
}

/// Immutable lookup table built at registration time.
///
/// Invariant: a public name lives in at most one of the proxied and masked
/// sets; masking always wins over exposure.
pub struct MethodTable<R> {
    proxied: HashMap<String, MethodFn<R>>,
    masked: HashSet<String>,
}

impl<R> MethodTable<R> {
    pub fn builder(policy: MaskPolicy) -> MethodTableBuilder<R> {
        MethodTableBuilder {
            policy,
            proxied: HashMap::new(),
            masked: HashSet::new(),
        }
    }

    fn lookup(&self, method: &str) -> Result<&MethodFn<R>, RouteError> {
        if method.starts_with('_') || self.masked.contains(method) {
            return Err(RouteError::Masked(method.to_owned()));
        }
        self.proxied
            .get(method)
            .ok_or_else(|| RouteError::NotImplemented(method.to_owned()))
    }

    pub fn is_proxied(&self, method: &str) -> bool {
        self.lookup(method).is_ok()
    }
}

pub struct MethodTableBuilder<R> {
    policy: MaskPolicy,
    proxied: HashMap<String, MethodFn<R>>,
    masked: HashSet<String>,
}

impl<R: Send + Sync + 'static> MethodTableBuilder<R> {
    /// Register a method under the policy's classification.
    pub fn method<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<R>, Session, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        match self.policy.classify(name) {
            Classification::Proxied(public) => {
                self.proxied.insert(public, wrap_method(handler));
            }
            Classification::Masked => {
                self.masked.insert(name.to_owned());
            }
            Classification::Unclassified => {}
        }
        self
    }

    /// Register a method and proxy it regardless of policy. An explicit
    /// mask for the same name still wins.
    pub fn expose<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Arc<R>, Session, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        if !name.starts_with('_') {
            self.proxied.insert(name.to_owned(), wrap_method(handler));
        }
        self
    }

    /// Mask a name outright.
    pub fn mask(mut self, name: &str) -> Self {
        self.masked.insert(name.to_owned());
        self
    }

    pub fn build(mut self) -> MethodTable<R> {
        for name in &self.masked {
            self.proxied.remove(name);
        }
        MethodTable {
            proxied: self.proxied,
            masked: self.masked,
        }
    }
}

fn wrap_method<R, F, Fut>(handler: F) -> MethodFn<R>
where
    F: Fn(Arc<R>, Session, Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(move |this, session, args| Box::pin(handler(this, session, args)))
}

/// A live per-session route instance, type-erased.
pub(crate) trait RouteInstance: Send + Sync {
    fn dispatch(
        &self,
        session: Session,
        method: &str,
        args: Args,
    ) -> Result<HandlerFuture, RouteError>;

    fn teardown(&self);
}

struct Instance<R: RouteHandler> {
    inner: Arc<R>,
    table: MethodTable<R>,
}

impl<R: RouteHandler> RouteInstance for Instance<R> {
    fn dispatch(
        &self,
        session: Session,
        method: &str,
        args: Args,
    ) -> Result<HandlerFuture, RouteError> {
        let handler = self.table.lookup(method)?;
        Ok(handler(self.inner.clone(), session, args))
    }

    fn teardown(&self) {
        self.inner.on_close();
    }
}

pub(crate) trait RouteFactory: Send + Sync {
    fn instantiate(&self, session: &Session) -> Arc<dyn RouteInstance>;
}

struct Factory<R>(PhantomData<fn() -> R>);

impl<R: RouteHandler> RouteFactory for Factory<R> {
    fn instantiate(&self, session: &Session) -> Arc<dyn RouteInstance> {
        Arc::new(Instance {
            inner: Arc::new(R::attach(session)),
            table: R::methods(),
        })
    }
}

#[derive(Clone)]
enum RouteTarget {
    Function(RouteFn),
    Stateful(Arc<dyn RouteFactory>),
}

/// Resolution outcome for a call path.
pub(crate) enum Resolved {
    Function(RouteFn),
    Stateful {
        name: String,
        factory: Arc<dyn RouteFactory>,
        method: String,
    },
}

/// Shared name-to-handler table.
///
/// One registry serves every session of an endpoint; it is passed around
/// explicitly by `Arc`, never stored in a global. Mutation is visible to
/// calls dispatched afterwards on any session; instances already memoized by
/// a session are unaffected.
pub struct RouteRegistry {
    routes: RwLock<HashMap<String, RouteTarget>>,
}

impl RouteRegistry {
    /// A registry with the built-in `ping` route, which echoes its keyword
    /// arguments back to the caller.
    pub fn new() -> Arc<Self> {
        let registry = Arc::new(Self {
            routes: RwLock::new(HashMap::new()),
        });
        // Pre-registered name, cannot collide.
        let _ = registry.add_route("ping", |_session, args: Args| async move {
            Ok(Value::Object(args.keyword))
        });
        registry
    }

    /// Register an async function route. The handler receives the calling
    /// session as its first argument.
    pub fn add_route<F, Fut>(&self, name: &str, handler: F) -> Result<(), RouteError>
    where
        F: Fn(Session, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        let wrapped: RouteFn = Arc::new(move |session, args| Box::pin(handler(session, args)));
        self.insert(name, RouteTarget::Function(wrapped))
    }

    /// Register a stateful route type.
    pub fn add_stateful<R: RouteHandler>(&self, name: &str) -> Result<(), RouteError> {
        self.insert(name, RouteTarget::Stateful(Arc::new(Factory::<R>(PhantomData))))
    }

    fn insert(&self, name: &str, target: RouteTarget) -> Result<(), RouteError> {
        let mut routes = self.routes.write();
        if routes.contains_key(name) {
            return Err(RouteError::Duplicate(name.to_owned()));
        }
        routes.insert(name.to_owned(), target);
        Ok(())
    }

    /// Remove a registration. With `fail` set, an absent name is an error;
    /// otherwise removal of an absent name is a no-op.
    pub fn remove_route(&self, name: &str, fail: bool) -> Result<(), RouteError> {
        let removed = self.routes.write().remove(name).is_some();
        if !removed && fail {
            return Err(RouteError::NotFound(name.to_owned()));
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.read().contains_key(name)
    }

    /// Resolve a call path.
    ///
    /// The path splits on the first `.` into a route name and a method. A
    /// dotless path addresses a function route directly, or a stateful
    /// route's `init` entry point. A dotted path whose head is not
    /// registered falls back to a function registered under the full dotted
    /// name.
    pub(crate) fn resolve(&self, path: &str) -> Result<Resolved, RouteError> {
        let routes = self.routes.read();

        let full = match routes.get(path) {
            Some(RouteTarget::Function(f)) => Some(Resolved::Function(f.clone())),
            Some(RouteTarget::Stateful(factory)) => Some(Resolved::Stateful {
                name: path.to_owned(),
                factory: factory.clone(),
                method: INIT_METHOD.to_owned(),
            }),
            None => None,
        };

        match path.split_once('.') {
            None => full.ok_or_else(|| RouteError::Unresolvable(path.to_owned())),
            Some((prefix, method)) => match routes.get(prefix) {
                Some(RouteTarget::Stateful(factory)) => Ok(Resolved::Stateful {
                    name: prefix.to_owned(),
                    factory: factory.clone(),
                    method: method.to_owned(),
                }),
                // A function route has no methods; only the full dotted
                // name can save the call.
                _ => full.ok_or_else(|| RouteError::Unresolvable(path.to_owned())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Dummy;

    impl RouteHandler for Dummy {
        fn attach(_session: &Session) -> Self {
            Dummy
        }

        fn methods() -> MethodTable<Self> {
            MethodTable::<Self>::builder(MaskPolicy::Default)
                .method("visible", |_, _, _| async { Ok(Value::Null) })
                .method("_hidden", |_, _, _| async { Ok(Value::Null) })
                .mask("forbidden")
                .method("forbidden", |_, _, _| async { Ok(Value::Null) })
                .build()
        }
    }

    #[test]
    fn default_policy_masks_underscores() {
        let table = Dummy::methods();
        assert!(table.is_proxied("visible"));
        assert!(matches!(
            table.lookup("_hidden"),
            Err(RouteError::Masked(_))
        ));
    }

    #[test]
    fn explicit_mask_wins_over_registration() {
        let table = Dummy::methods();
        assert!(matches!(
            table.lookup("forbidden"),
            Err(RouteError::Masked(_))
        ));
    }

    #[test]
    fn unknown_method_is_not_implemented() {
        let table = Dummy::methods();
        assert!(matches!(
            table.lookup("absent"),
            Err(RouteError::NotImplemented(_))
        ));
    }

    #[test]
    fn allow_list_requires_expose() {
        let table: MethodTable<Dummy> = MethodTable::<Dummy>::builder(MaskPolicy::AllowList)
            .method("implicit", |_, _, _| async { Ok(Value::Null) })
            .expose("explicit", |_, _, _| async { Ok(Value::Null) })
            .build();
        assert!(!table.is_proxied("implicit"));
        assert!(table.is_proxied("explicit"));
    }

    #[test]
    fn prefix_policy_strips_prefix() {
        let table: MethodTable<Dummy> = MethodTable::<Dummy>::builder(MaskPolicy::Prefix("rpc_"))
            .method("rpc_add", |_, _, _| async { Ok(json!(3)) })
            .method("helper", |_, _, _| async { Ok(Value::Null) })
            .build();
        assert!(table.is_proxied("add"));
        assert!(!table.is_proxied("rpc_add"));
        assert!(!table.is_proxied("helper"));
    }

    #[test]
    fn registry_rejects_duplicates() {
        let registry = RouteRegistry::new();
        registry
            .add_route("echo", |_s, a: Args| async move {
                Ok(Value::Array(a.positional))
            })
            .unwrap();
        assert!(matches!(
            registry.add_route("echo", |_s, _a| async { Ok(Value::Null) }),
            Err(RouteError::Duplicate(_))
        ));
    }

    #[test]
    fn remove_route_honours_fail_flag() {
        let registry = RouteRegistry::new();
        assert!(registry.remove_route("nope", false).is_ok());
        assert!(matches!(
            registry.remove_route("nope", true),
            Err(RouteError::NotFound(_))
        ));
    }

    #[test]
    fn resolve_splits_on_first_dot() {
        let registry = RouteRegistry::new();
        registry.add_stateful::<Dummy>("chat").unwrap();

        match registry.resolve("chat.post.extra").unwrap() {
            Resolved::Stateful { name, method, .. } => {
                assert_eq!(name, "chat");
                assert_eq!(method, "post.extra");
            }
            Resolved::Function(_) => panic!("expected stateful"),
        }
    }

    #[test]
    fn dotless_stateful_path_targets_init() {
        let registry = RouteRegistry::new();
        registry.add_stateful::<Dummy>("chat").unwrap();

        match registry.resolve("chat").unwrap() {
            Resolved::Stateful { method, .. } => assert_eq!(method, INIT_METHOD),
            Resolved::Function(_) => panic!("expected stateful"),
        }
    }

    #[test]
    fn dotted_function_name_falls_back_to_full_path() {
        let registry = RouteRegistry::new();
        registry
            .add_route("math.add", |_s, _a| async { Ok(json!(0)) })
            .unwrap();

        assert!(matches!(
            registry.resolve("math.add").unwrap(),
            Resolved::Function(_)
        ));
    }

    #[test]
    fn unknown_path_is_unresolvable() {
        let registry = RouteRegistry::new();
        assert!(matches!(
            registry.resolve("ghost.walk"),
            Err(RouteError::Unresolvable(_))
        ));
        assert!(matches!(
            registry.resolve("ghost"),
            Err(RouteError::Unresolvable(_))
        ));
    }

    #[test]
    fn ping_is_pre_registered() {
        let registry = RouteRegistry::new();
        assert!(registry.contains("ping"));
    }
}
