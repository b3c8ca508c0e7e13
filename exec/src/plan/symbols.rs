use crate::core::ValueType;
use anyhow::{bail, ensure, Result};
use hashbrown::HashMap;

/// Direction of a library-node parameter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ParamDir {
    In,
    InOut,
}

/// Declaration of an executable command: return type (if any), parameter
/// types, and whether extra parameters of any type are accepted.
#[derive(Clone, Debug)]
pub struct CommandDecl {
    pub return_type: Option<ValueType>,
    pub param_types: Vec<ValueType>,
    pub any_params: bool,
}

/// Declaration of an external state (lookup).
#[derive(Clone, Debug)]
pub struct LookupDecl {
    pub return_type: ValueType,
    pub param_types: Vec<ValueType>,
    pub any_params: bool,
}

/// Declaration of a library node's interface.
#[derive(Clone, Debug)]
pub struct LibraryDecl {
    pub params: Vec<(String, ParamDir, ValueType)>,
}

/// Global declarations a plan is checked against: commands, lookups and
/// library nodes by name. Duplicate declarations are load-time errors.
#[derive(Clone, Debug, Default)]
pub struct SymbolTable {
    commands: HashMap<String, CommandDecl>,
    lookups: HashMap<String, LookupDecl>,
    libraries: HashMap<String, LibraryDecl>,
}

impl SymbolTable {
    pub fn new() -> SymbolTable {
        SymbolTable::default()
    }

    pub fn declare_command(&mut self, name: impl Into<String>, decl: CommandDecl) -> Result<()> {
        let name = name.into();
        ensure!(!name.is_empty(), "empty command name");
        if self.commands.insert(name.clone(), decl).is_some() {
            bail!("duplicate command declaration: {name}");
        }
        Ok(())
    }

    pub fn declare_lookup(&mut self, name: impl Into<String>, decl: LookupDecl) -> Result<()> {
        let name = name.into();
        ensure!(!name.is_empty(), "empty lookup name");
        if self.lookups.insert(name.clone(), decl).is_some() {
            bail!("duplicate lookup declaration: {name}");
        }
        Ok(())
    }

    pub fn declare_library(&mut self, name: impl Into<String>, decl: LibraryDecl) -> Result<()> {
        let name = name.into();
        ensure!(!name.is_empty(), "empty library node name");
        if self.libraries.insert(name.clone(), decl).is_some() {
            bail!("duplicate library node declaration: {name}");
        }
        Ok(())
    }

    pub fn command(&self, name: &str) -> Option<&CommandDecl> {
        self.commands.get(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&LookupDecl> {
        self.lookups.get(name)
    }

    pub fn library(&self, name: &str) -> Option<&LibraryDecl> {
        self.libraries.get(name)
    }

    /// Checks an argument type list against a declaration's parameters.
    pub(crate) fn check_params(
        declared: &[ValueType],
        any_params: bool,
        actual: &[Option<ValueType>],
        what: &str,
    ) -> Result<()> {
        if !any_params {
            ensure!(
                actual.len() == declared.len(),
                "{what}: expected {} arguments, got {}",
                declared.len(),
                actual.len()
            );
        }
        for (i, (want, got)) in declared.iter().zip(actual).enumerate() {
            if let Some(got) = got {
                ensure!(
                    want.readable_from(*got),
                    "{what}: argument {i} has type {got}, expected {want}"
                );
            }
        }
        Ok(())
    }
}
