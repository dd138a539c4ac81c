use crate::{AsValue, DbEnum, EngineError, Error, Result, Row, Value};
use std::{
    any::{Any, TypeId, type_name},
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display},
    hash::{Hash, Hasher},
    sync::{Arc, RwLock},
};

/// How an enum field is written to and read from its column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnumEncoding {
    /// Variant name as text.
    #[default]
    String,
    /// Zero based position of the variant.
    Ordinal,
    /// Numeric identifier chosen by the application.
    ById,
}

impl Display for EnumEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EnumEncoding::String => "STRING",
            EnumEncoding::Ordinal => "ORDINAL",
            EnumEncoding::ById => "BY_ID",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    /// Name used in method identifiers, `lastName`.
    pub name: Cow<'static, str>,
    /// Column in the store, `last_name`.
    pub column_name: Cow<'static, str>,
    /// Declared type as a typed NULL.
    pub value: Value,
    pub enum_encoding: Option<EnumEncoding>,
}

impl FieldDescriptor {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        column_name: impl Into<Cow<'static, str>>,
        value: Value,
    ) -> Self {
        Self {
            name: name.into(),
            column_name: column_name.into(),
            value,
            enum_encoding: None,
        }
    }
}

/// Static metadata of a stored entity. Field order is fixed once built.
#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub entity_name: Cow<'static, str>,
    pub table_name: Cow<'static, str>,
    pub fields: Box<[FieldDescriptor]>,
    /// Index of the identity field in `fields`.
    pub identity: usize,
    /// Rows accumulated before a batch is flushed, `None` writes immediately and
    /// `Some(0)` uses the engine default.
    pub batch_size: Option<usize>,
}

impl EntityDescriptor {
    pub fn identity_field(&self) -> &FieldDescriptor {
        &self.fields[self.identity]
    }

    /// Case insensitive lookup by logical field name.
    pub fn field(&self, name: &str) -> Result<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                Error::new(EngineError::FieldNotFound {
                    entity: self.entity_name.to_string(),
                    field: name.to_string(),
                })
            })
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))
    }
}

impl PartialEq for EntityDescriptor {
    fn eq(&self, other: &Self) -> bool {
        self.entity_name == other.entity_name
            && self.table_name == other.table_name
            && self.identity == other.identity
            && self.fields == other.fields
    }
}

impl Eq for EntityDescriptor {}

impl Hash for EntityDescriptor {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity_name.hash(state);
        self.table_name.hash(state);
    }
}

type Getter<E> = Box<dyn Fn(&E) -> Value + Send + Sync>;
type Setter<E> = Box<dyn Fn(&mut E, Value) -> Result<()> + Send + Sync>;

/// Accessor and mutator of one field, resolved when the entity is registered.
pub struct FieldAccess<E> {
    pub get: Getter<E>,
    pub set: Setter<E>,
}

/// Descriptor plus the typed accessors needed to move values in and out of `E`.
pub struct EntityModel<E> {
    pub descriptor: Arc<EntityDescriptor>,
    pub access: Box<[FieldAccess<E>]>,
}

impl<E: Default> EntityModel<E> {
    pub fn builder(
        entity_name: impl Into<Cow<'static, str>>,
        table_name: impl Into<Cow<'static, str>>,
    ) -> EntityModelBuilder<E> {
        EntityModelBuilder {
            entity_name: entity_name.into(),
            table_name: table_name.into(),
            fields: Vec::new(),
            access: Vec::new(),
            identity: None,
            batch_size: None,
        }
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.descriptor
    }

    /// Values of every field, in descriptor order.
    pub fn row(&self, entity: &E) -> Row {
        self.access.iter().map(|a| (a.get)(entity)).collect()
    }

    pub fn identity(&self, entity: &E) -> Value {
        (self.access[self.descriptor.identity].get)(entity)
    }

    pub fn set_identity(&self, entity: &mut E, value: Value) -> Result<()> {
        (self.access[self.descriptor.identity].set)(entity, value)
    }

    /// Build an entity from values positionally aligned with `fields`.
    ///
    /// A value that does not fit its field is logged and the field keeps its
    /// default, except the identity field which must always decode.
    pub fn from_values(
        &self,
        fields: impl IntoIterator<Item = usize>,
        values: impl IntoIterator<Item = Value>,
    ) -> Result<E> {
        let mut entity = E::default();
        for (index, value) in fields.into_iter().zip(values) {
            let Some(access) = self.access.get(index) else {
                continue;
            };
            if let Err(e) = (access.set)(&mut entity, value) {
                let field = &self.descriptor.fields[index];
                let e = e.context(format!(
                    "While mapping column `{}` of `{}`",
                    field.column_name, self.descriptor.table_name
                ));
                if index == self.descriptor.identity {
                    log::error!("{:#}", e);
                    return Err(e);
                }
                log::warn!("{:#}", e);
            }
        }
        Ok(entity)
    }
}

pub struct EntityModelBuilder<E> {
    entity_name: Cow<'static, str>,
    table_name: Cow<'static, str>,
    fields: Vec<FieldDescriptor>,
    access: Vec<FieldAccess<E>>,
    identity: Option<usize>,
    batch_size: Option<usize>,
}

impl<E: Default + 'static> EntityModelBuilder<E> {
    /// Add a field whose type implements [`AsValue`].
    pub fn field<T: AsValue + 'static>(
        mut self,
        name: &'static str,
        column_name: &'static str,
        get: fn(&E) -> T,
        set: fn(&mut E, T),
    ) -> Self {
        self.fields
            .push(FieldDescriptor::new(name, column_name, T::as_empty_value()));
        self.access.push(FieldAccess {
            get: Box::new(move |e| get(e).as_value()),
            set: Box::new(move |e, v| {
                set(e, T::try_from_value(v)?);
                Ok(())
            }),
        });
        self
    }

    /// Add the identity field, exactly one per entity.
    pub fn identity<T: AsValue + 'static>(
        mut self,
        name: &'static str,
        column_name: &'static str,
        get: fn(&E) -> T,
        set: fn(&mut E, T),
    ) -> Self {
        self.identity = Some(self.fields.len());
        self.field(name, column_name, get, set)
    }

    /// Add an enum field stored through `encoding`.
    pub fn enum_field<T: DbEnum>(
        mut self,
        name: &'static str,
        column_name: &'static str,
        encoding: EnumEncoding,
        get: fn(&E) -> T,
        set: fn(&mut E, T),
    ) -> Self {
        self.fields.push(FieldDescriptor {
            enum_encoding: Some(encoding),
            ..FieldDescriptor::new(name, column_name, Value::Enum(None))
        });
        self.access.push(FieldAccess {
            get: Box::new(move |e| get(e).as_enum_value()),
            set: Box::new(move |e, v| {
                set(e, T::from_value(v, encoding)?);
                Ok(())
            }),
        });
        self
    }

    /// Batch inserts, flushing every `batch_size` rows.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Batch inserts using the engine wide batch size.
    pub fn batched(mut self) -> Self {
        self.batch_size = Some(0);
        self
    }

    pub fn build(self) -> Result<EntityModel<E>> {
        let Some(identity) = self.identity else {
            return Err(Error::msg(format!(
                "Entity `{}` must declare exactly one identity field",
                self.entity_name
            )));
        };
        Ok(EntityModel {
            descriptor: Arc::new(EntityDescriptor {
                entity_name: self.entity_name,
                table_name: self.table_name,
                fields: self.fields.into(),
                identity,
                batch_size: self.batch_size,
            }),
            access: self.access.into(),
        })
    }
}

/// Records persisted through the engine.
pub trait Entity: Default + Send + Sync + 'static {
    fn model() -> Result<EntityModel<Self>>;
}

/// Models registered for the lifetime of an engine, looked up by type.
#[derive(Default)]
pub struct EntityRegistry {
    models: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn register<E: Entity>(&self) -> Result<Arc<EntityModel<E>>> {
        let model = Arc::new(E::model()?);
        log::debug!(
            "Registered entity `{}` on table `{}`",
            model.descriptor.entity_name,
            model.descriptor.table_name
        );
        self.models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(TypeId::of::<E>(), model.clone());
        Ok(model)
    }

    pub fn model<E: Entity>(&self) -> Result<Arc<EntityModel<E>>> {
        self.models
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&TypeId::of::<E>())
            .cloned()
            .and_then(|v| v.downcast::<EntityModel<E>>().ok())
            .ok_or_else(|| Error::new(EngineError::DescriptorNotFound(type_name::<E>().into())))
    }
}
