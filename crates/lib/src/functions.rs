//! Core function library available in every blueprint.
//!
//! Providers may register additional functions under their own names; these
//! are the ones the engine ships with.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::registry::{Function, FunctionArgs, FunctionContext, FunctionError, ProviderRegistry};
use crate::value::MappingNode;

type PureFn = fn(&FunctionArgs) -> Result<MappingNode, FunctionError>;

/// A function that only depends on its arguments.
struct PureFunction {
  name: &'static str,
  call: PureFn,
}

#[async_trait]
impl Function for PureFunction {
  fn name(&self) -> &str {
    self.name
  }

  async fn call(&self, args: FunctionArgs, _ctx: &FunctionContext) -> Result<MappingNode, FunctionError> {
    (self.call)(&args)
  }
}

/// `map(list, "function")` applies a named function to every item.
struct MapFunction;

#[async_trait]
impl Function for MapFunction {
  fn name(&self) -> &str {
    "map"
  }

  async fn call(&self, args: FunctionArgs, ctx: &FunctionContext) -> Result<MappingNode, FunctionError> {
    let items = args.require_list(0, "items")?;
    let function = args.require_str(1, "function")?;

    let mut out = Vec::with_capacity(items.len());
    for item in items {
      let value = ctx.call(function, FunctionArgs::positional(vec![item.clone()])).await?;
      if !value.is_none() {
        out.push(value);
      }
    }
    Ok(MappingNode::Items(out))
  }
}

/// Register every core function.
pub fn register_core_functions(registry: &mut ProviderRegistry) {
  let pure: [(&'static str, PureFn); 14] = [
    ("join", join),
    ("split", split),
    ("len", len),
    ("concat", concat),
    ("if", if_),
    ("eq", eq),
    ("not", not),
    ("coalesce", coalesce),
    ("lookup", lookup),
    ("object", object),
    ("list", list),
    ("trim", trim),
    ("to_upper", to_upper),
    ("to_lower", to_lower),
  ];
  for (name, call) in pure {
    registry.register_function(PureFunction { name, call });
  }
  registry.register_function(MapFunction);
}

fn join(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let items = args.require_list(0, "items")?;
  let separator = args.require_str(1, "separator")?;
  let parts = items
    .iter()
    .map(|item| {
      item
        .as_scalar()
        .map(|s| s.to_interpolated())
        .ok_or_else(|| FunctionError::InvalidArgs(format!("join expects scalar items, got {}", item.kind())))
    })
    .collect::<Result<Vec<_>, _>>()?;
  Ok(MappingNode::string(parts.join(separator)))
}

fn split(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let input = args.require_str(0, "input")?;
  let separator = args.require_str(1, "separator")?;
  Ok(MappingNode::Items(input.split(separator).map(MappingNode::string).collect()))
}

fn len(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let value = args.require(0, "value")?;
  let len = match value {
    MappingNode::Items(items) => items.len(),
    MappingNode::Fields(fields) => fields.len(),
    MappingNode::Scalar(s) if s.as_str().is_some() => s.as_str().map(|s| s.chars().count()).unwrap_or_default(),
    other => {
      return Err(FunctionError::InvalidArgs(format!(
        "len expects a list, mapping or string, got {}",
        other.kind()
      )));
    }
  };
  Ok(MappingNode::int(len as i64))
}

fn concat(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let mut out = Vec::new();
  for (idx, arg) in args.positional.iter().enumerate() {
    match arg {
      MappingNode::Items(items) => out.extend(items.iter().cloned()),
      MappingNode::None => {}
      other => {
        return Err(FunctionError::InvalidArgs(format!(
          "concat argument {idx} must be a list, got {}",
          other.kind()
        )));
      }
    }
  }
  Ok(MappingNode::Items(out))
}

fn if_(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let condition = args.require(0, "condition")?;
  let condition = condition
    .as_bool()
    .ok_or_else(|| FunctionError::InvalidArgs(format!("if condition must be a boolean, got {}", condition.kind())))?;
  let branch = if condition {
    args.get(1, "then")
  } else {
    args.get(2, "else")
  };
  Ok(branch.cloned().unwrap_or_default())
}

fn eq(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let a = args.require(0, "a")?;
  let b = args.require(1, "b")?;
  Ok(MappingNode::bool(a == b))
}

fn not(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let value = args.require(0, "value")?;
  value
    .as_bool()
    .map(|b| MappingNode::bool(!b))
    .ok_or_else(|| FunctionError::InvalidArgs(format!("not expects a boolean, got {}", value.kind())))
}

fn coalesce(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  Ok(args.positional.iter().find(|arg| !arg.is_none()).cloned().unwrap_or_default())
}

fn lookup(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  let mapping = args.require(0, "mapping")?;
  let key = args.require_str(1, "key")?;
  let fields = mapping
    .as_fields()
    .ok_or_else(|| FunctionError::InvalidArgs(format!("lookup expects a mapping, got {}", mapping.kind())))?;
  match fields.get(key) {
    Some(value) => Ok(value.clone()),
    None => Ok(args.get(2, "default").cloned().unwrap_or_default()),
  }
}

fn object(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  if !args.positional.is_empty() {
    return Err(FunctionError::InvalidArgs("object only accepts named arguments".to_string()));
  }
  let fields: BTreeMap<String, MappingNode> = args
    .named
    .iter()
    .filter(|(_, v)| !v.is_none())
    .map(|(k, v)| (k.clone(), v.clone()))
    .collect();
  Ok(MappingNode::Fields(fields))
}

fn list(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  Ok(MappingNode::Items(
    args.positional.iter().filter(|v| !v.is_none()).cloned().collect(),
  ))
}

fn trim(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  Ok(MappingNode::string(args.require_str(0, "input")?.trim()))
}

fn to_upper(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  Ok(MappingNode::string(args.require_str(0, "input")?.to_uppercase()))
}

fn to_lower(args: &FunctionArgs) -> Result<MappingNode, FunctionError> {
  Ok(MappingNode::string(args.require_str(0, "input")?.to_lowercase()))
}
