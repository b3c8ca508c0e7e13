//! Global tunables initialized from environment variables.
//!
//! An [EnvParam] pairs the name of an environment variable with a default
//! value in string form. The parameter is parsed on first access and cached
//! for the lifetime of the process; later changes to the environment are
//! ignored. This is meant for knobs that are too niche for a public API but
//! occasionally useful when diagnosing an engine run.
//!
//! ```
//! use env_param::EnvParam;
//! static LIMIT: EnvParam<u32> = EnvParam::new("MY_TOOL_LIMIT", "1000");
//!
//! assert_eq!(LIMIT.get(), 1000); // variable not set, default applies
//! ```

use std::fmt::Debug;
use std::str::FromStr;

pub struct EnvParam<T> {
    env: &'static str,
    default: &'static str,
    cached: once_cell::sync::OnceCell<T>,
}

impl<T> EnvParam<T> {
    pub const fn new(env: &'static str, default: &'static str) -> EnvParam<T> {
        EnvParam {
            env,
            default,
            cached: once_cell::sync::OnceCell::new(),
        }
    }

    /// Name of the backing environment variable.
    pub fn var_name(&self) -> &'static str {
        self.env
    }
}

impl<T: FromStr> EnvParam<T> {
    /// Returns the parameter value, reading the environment variable on the
    /// first call. An unset variable yields the default; a variable that
    /// fails to parse yields the default with a diagnostic on stderr.
    ///
    /// Panics if the compiled-in default itself does not parse.
    pub fn get_ref(&self) -> &T {
        self.cached.get_or_init(|| match std::env::var(self.env) {
            Ok(raw) => T::from_str(&raw).unwrap_or_else(|_| {
                eprintln!(
                    "[env_param] {}: unparseable value {:?}, falling back to default {:?}",
                    self.env, raw, self.default
                );
                self.parsed_default()
            }),
            Err(std::env::VarError::NotPresent) => self.parsed_default(),
            Err(err) => {
                eprintln!("[env_param] {}: {err}, falling back to default {:?}", self.env, self.default);
                self.parsed_default()
            }
        })
    }

    pub fn get(&self) -> T
    where
        T: Copy,
    {
        *self.get_ref()
    }

    /// Forces the parameter to `value`, bypassing the environment.
    ///
    /// Panics if the parameter was already read or set.
    pub fn set(&self, value: T)
    where
        T: Debug,
    {
        let already = self.cached.set(value).is_err();
        assert!(!already, "[env_param] {}: set after initialization", self.env);
    }

    fn parsed_default(&self) -> T {
        match T::from_str(self.default) {
            Ok(v) => v,
            Err(_) => panic!(
                "[env_param] {}: compiled-in default {:?} does not parse",
                self.env, self.default
            ),
        }
    }
}
