//! Frame-level security
//!
//! A [`SecurityRegistry`] holds an ordered list of [`Limitation`]s, each a
//! conjunction of frame matchers (command set, destination set) and security
//! matchers (principal-exists, role membership, permit-all, deny-all). A
//! frame is denied when any limitation that matches it fails its security
//! matchers; a frame matched by no limitation is permitted.
//!
//! The registry is populated once at startup by [`SecurityCustomizer`]s,
//! ordered by priority. Glob compile failures abort configuration before any
//! traffic is served.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use crate::glob::{Glob, GlobCache, GlobError};
use crate::stomp::{Command, Frame};

/// The caller identity a frame is evaluated against. Passed explicitly
/// through every call that needs it; there is no ambient holder.
#[derive(Debug, Clone, Default)]
pub struct SecurityContext {
    principal: Option<String>,
    roles: HashSet<String>,
}

impl SecurityContext {
    /// An unauthenticated caller.
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// A caller authenticated as `name`, with no roles.
    pub fn principal(name: impl Into<String>) -> Self {
        Self {
            principal: Some(name.into()),
            roles: HashSet::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn principal_name(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    pub fn is_in_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }
}

/// How a single configured destination is tested: exact comparison when the
/// pattern has no wildcard, glob match otherwise.
#[derive(Debug, Clone)]
pub enum DestinationMatcher {
    Exact(String),
    Pattern(Arc<Glob>),
}

impl DestinationMatcher {
    fn matches(&self, destination: &str) -> bool {
        match self {
            DestinationMatcher::Exact(exact) => exact == destination,
            DestinationMatcher::Pattern(glob) => glob.matches(destination),
        }
    }
}

/// A condition on the frame itself.
#[derive(Debug, Clone)]
pub enum FrameMatcher {
    /// Matches frames whose command is in the set.
    Commands(HashSet<Command>),
    /// Matches frames whose destination satisfies every configured matcher.
    /// A frame without a destination never matches.
    Destinations(Vec<DestinationMatcher>),
}

impl FrameMatcher {
    pub fn matches(&self, frame: &Frame) -> bool {
        match self {
            FrameMatcher::Commands(commands) => commands.contains(&frame.command()),
            FrameMatcher::Destinations(matchers) => match frame.destination() {
                Some(destination) => matchers.iter().all(|m| m.matches(destination)),
                None => false,
            },
        }
    }
}

/// A condition on the caller identity.
#[derive(Debug, Clone)]
pub enum SecurityMatcher {
    PrincipalExists,
    /// Passes when the caller holds any of the listed roles.
    RolesAllowed(Vec<String>),
    PermitAll,
    DenyAll,
}

impl SecurityMatcher {
    pub fn is_permitted(&self, ctx: &SecurityContext) -> bool {
        match self {
            SecurityMatcher::PrincipalExists => ctx.principal_name().is_some(),
            SecurityMatcher::RolesAllowed(roles) => roles.iter().any(|r| ctx.is_in_role(r)),
            SecurityMatcher::PermitAll => true,
            SecurityMatcher::DenyAll => false,
        }
    }
}

/// One security rule: all frame matchers AND all security matchers.
#[derive(Debug, Clone)]
pub struct Limitation {
    frame_matchers: Vec<FrameMatcher>,
    security_matchers: Vec<SecurityMatcher>,
}

impl Limitation {
    pub fn new(frame_matchers: Vec<FrameMatcher>, security_matchers: Vec<SecurityMatcher>) -> Self {
        Self {
            frame_matchers,
            security_matchers,
        }
    }

    /// Whether this limitation applies to the frame.
    pub fn matches(&self, frame: &Frame) -> bool {
        self.frame_matchers.iter().all(|m| m.matches(frame))
    }

    /// Whether the caller passes every security matcher.
    pub fn is_permitted(&self, ctx: &SecurityContext) -> bool {
        self.security_matchers.iter().all(|m| m.is_permitted(ctx))
    }
}

/// Populates limitations at startup. Lower priority runs first.
pub trait SecurityCustomizer: Send + Sync {
    fn priority(&self) -> i32 {
        5000
    }

    fn configure(&self, registry: &mut SecurityRegistry) -> Result<(), GlobError>;
}

/// The ordered rule set frames are gated through.
#[derive(Debug, Default)]
pub struct SecurityRegistry {
    limitations: Vec<Limitation>,
    globs: GlobCache,
}

impl SecurityRegistry {
    pub fn new() -> Self {
        Self {
            limitations: Vec::new(),
            globs: GlobCache::default(),
        }
    }

    /// Start building a limitation; finish with
    /// [`LimitationBuilder::register`].
    pub fn limitation(&mut self) -> LimitationBuilder<'_> {
        LimitationBuilder {
            registry: self,
            frame_matchers: Vec::new(),
            security_matchers: Vec::new(),
        }
    }

    pub fn register(&mut self, limitation: Limitation) {
        self.limitations.push(limitation);
    }

    /// Apply customizers in priority order (lower first). Any error aborts
    /// before traffic is served.
    pub fn configure_all(
        &mut self,
        mut customizers: Vec<Box<dyn SecurityCustomizer>>,
    ) -> Result<(), GlobError> {
        customizers.sort_by_key(|c| c.priority());
        for customizer in customizers {
            customizer.configure(self)?;
        }
        Ok(())
    }

    /// Evaluate a frame against the caller identity.
    ///
    /// Every limitation matching the frame must pass its security matchers;
    /// a frame matched by none is permitted.
    pub fn is_permitted(&self, frame: &Frame, ctx: &SecurityContext) -> bool {
        for limitation in self.limitations.iter().filter(|l| l.matches(frame)) {
            if !limitation.is_permitted(ctx) {
                debug!(
                    command = %frame.command(),
                    destination = frame.destination().unwrap_or(""),
                    principal = ctx.principal_name().unwrap_or(""),
                    "frame denied"
                );
                return false;
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.limitations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limitations.is_empty()
    }
}

/// Accumulates matchers for one [`Limitation`] and registers it.
pub struct LimitationBuilder<'a> {
    registry: &'a mut SecurityRegistry,
    frame_matchers: Vec<FrameMatcher>,
    security_matchers: Vec<SecurityMatcher>,
}

impl LimitationBuilder<'_> {
    /// Limit frames whose command is one of `commands`.
    pub fn commands(mut self, commands: &[Command]) -> Self {
        self.frame_matchers
            .push(FrameMatcher::Commands(commands.iter().copied().collect()));
        self
    }

    /// Limit frames whose destination matches all of `patterns`. Patterns
    /// without a wildcard are compared exactly, the rest through the glob
    /// cache; a bad pattern fails configuration here.
    pub fn destinations(mut self, patterns: &[&str]) -> Result<Self, GlobError> {
        let mut matchers = Vec::with_capacity(patterns.len());
        for pattern in patterns {
            let glob = self.registry.globs.get(pattern)?;
            if glob.has_wildcard() {
                matchers.push(DestinationMatcher::Pattern(glob));
            } else {
                matchers.push(DestinationMatcher::Exact((*pattern).to_string()));
            }
        }
        self.frame_matchers.push(FrameMatcher::Destinations(matchers));
        Ok(self)
    }

    /// Require an authenticated principal.
    pub fn principal_exists(mut self) -> Self {
        self.security_matchers.push(SecurityMatcher::PrincipalExists);
        self
    }

    /// Require any of the listed roles.
    pub fn roles(mut self, roles: &[&str]) -> Self {
        self.security_matchers.push(SecurityMatcher::RolesAllowed(
            roles.iter().map(|r| (*r).to_string()).collect(),
        ));
        self
    }

    pub fn permit_all(mut self) -> Self {
        self.security_matchers.push(SecurityMatcher::PermitAll);
        self
    }

    pub fn deny_all(mut self) -> Self {
        self.security_matchers.push(SecurityMatcher::DenyAll);
        self
    }

    /// Finish and register with the registry.
    pub fn register(self) {
        let limitation = Limitation::new(self.frame_matchers, self.security_matchers);
        self.registry.register(limitation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_to(destination: &str) -> Frame {
        Frame::send(destination, "x").build().unwrap()
    }

    #[test]
    fn test_default_allow_without_limitations() {
        let registry = SecurityRegistry::new();
        assert!(registry.is_permitted(&send_to("/anywhere"), &SecurityContext::anonymous()));
    }

    #[test]
    fn test_role_limitation_on_glob_destination() {
        let mut registry = SecurityRegistry::new();
        registry
            .limitation()
            .destinations(&["/admin/*"])
            .unwrap()
            .roles(&["admin"])
            .register();

        let admin = SecurityContext::principal("root").with_roles(["admin"]);
        let user = SecurityContext::principal("bob");

        assert!(registry.is_permitted(&send_to("/admin/x"), &admin));
        assert!(!registry.is_permitted(&send_to("/admin/x"), &user));
        // no applicable limitation
        assert!(registry.is_permitted(&send_to("/public/y"), &user));
    }

    #[test]
    fn test_exact_destination_without_wildcard() {
        let mut registry = SecurityRegistry::new();
        registry
            .limitation()
            .destinations(&["/queue/private"])
            .unwrap()
            .principal_exists()
            .register();

        let anon = SecurityContext::anonymous();
        assert!(!registry.is_permitted(&send_to("/queue/private"), &anon));
        assert!(registry.is_permitted(&send_to("/queue/private2"), &anon));
        assert!(registry.is_permitted(
            &send_to("/queue/private"),
            &SecurityContext::principal("alice")
        ));
    }

    #[test]
    fn test_command_matcher() {
        let mut registry = SecurityRegistry::new();
        registry
            .limitation()
            .commands(&[Command::Subscribe])
            .principal_exists()
            .register();

        let anon = SecurityContext::anonymous();
        let subscribe = Frame::subscribe("1", "/topic/a").build().unwrap();
        assert!(!registry.is_permitted(&subscribe, &anon));
        assert!(registry.is_permitted(&send_to("/topic/a"), &anon));
    }

    #[test]
    fn test_deny_all() {
        let mut registry = SecurityRegistry::new();
        registry
            .limitation()
            .destinations(&["/forbidden/*"])
            .unwrap()
            .deny_all()
            .register();

        let admin = SecurityContext::principal("root").with_roles(["admin"]);
        assert!(!registry.is_permitted(&send_to("/forbidden/x"), &admin));
    }

    #[test]
    fn test_destination_matcher_ignores_frames_without_destination() {
        let mut registry = SecurityRegistry::new();
        registry
            .limitation()
            .destinations(&["/admin/*"])
            .unwrap()
            .deny_all()
            .register();

        let disconnect = Frame::disconnect().build().unwrap();
        assert!(registry.is_permitted(&disconnect, &SecurityContext::anonymous()));
    }

    #[test]
    fn test_invalid_pattern_fails_configuration() {
        let mut registry = SecurityRegistry::new();
        let result = registry.limitation().destinations(&["/foo.{a,b}"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_customizers_run_in_priority_order() {
        struct First;
        impl SecurityCustomizer for First {
            fn priority(&self) -> i32 {
                10
            }
            fn configure(&self, registry: &mut SecurityRegistry) -> Result<(), GlobError> {
                registry.limitation().commands(&[Command::Send]).permit_all().register();
                Ok(())
            }
        }

        struct Second;
        impl SecurityCustomizer for Second {
            fn configure(&self, registry: &mut SecurityRegistry) -> Result<(), GlobError> {
                // relies on First having run
                assert_eq!(registry.len(), 1);
                registry.limitation().commands(&[Command::Subscribe]).deny_all().register();
                Ok(())
            }
        }

        let mut registry = SecurityRegistry::new();
        registry
            .configure_all(vec![Box::new(Second), Box::new(First)])
            .unwrap();
        assert_eq!(registry.len(), 2);
    }
}
