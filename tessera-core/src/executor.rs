use crate::{
    BatchCollector, BatchKey, BatchSink, Cardinality, Connection, ConnectionPool, Driver,
    EngineError, Entity, EntityDescriptor, EntityModel, EntityRegistry, EnumEncoding, Error,
    FieldDescriptor, MethodNameParser, PlanId, Query, QueryBuilder, QueryPlan, QueryPlanCache,
    Result, ReturnShape, Row, RowLabeled, RowsAffected, SqlWriter, Value, multi_row_insert,
    stream::TryStreamExt, truncate_long,
};
use std::{pin::pin, sync::Arc};

/// Writes batches through pooled connections with one multi-row insert.
pub struct PoolSink<D: Driver> {
    pool: Arc<ConnectionPool<D>>,
    writer: D::SqlWriter,
}

impl<D: Driver> PoolSink<D> {
    pub fn new(pool: Arc<ConnectionPool<D>>) -> Self {
        let writer = pool.driver().sql_writer();
        Self { pool, writer }
    }
}

impl<D: Driver> BatchSink for PoolSink<D> {
    async fn write_batch(&self, key: &BatchKey, rows: &[Row]) -> Result<RowsAffected> {
        let sql = multi_row_insert(&self.writer, &key.sql, key.entity.fields.len(), rows.len());
        let params = rows.iter().flat_map(|row| row.iter().cloned()).collect();
        let mut connection = self.pool.acquire().await?;
        let result = connection.execute(Query::with_params(sql, params)).await;
        self.pool.release(connection).await;
        result
    }
}

/// Result of a repository call, shaped by its declared [`ReturnShape`].
#[derive(Debug, PartialEq)]
pub enum QueryOutput<E> {
    Single(Option<E>),
    Multiple(Vec<E>),
    Nothing,
}

impl<E> QueryOutput<E> {
    pub fn into_vec(self) -> Vec<E> {
        match self {
            QueryOutput::Single(v) => v.into_iter().collect(),
            QueryOutput::Multiple(v) => v,
            QueryOutput::Nothing => Vec::new(),
        }
    }
}

/// Rows fetched or the modify summary of a statement.
#[derive(Debug, Default)]
struct Fetched {
    rows: Vec<RowLabeled>,
    affected: RowsAffected,
}

/// Value to bind for `value` given the enum encoding of its field.
///
/// Non enum values are returned untouched, enums without an explicit encoding
/// are stored by name.
pub fn encode_value(value: Value, encoding: Option<EnumEncoding>) -> Result<Value> {
    let Value::Enum(enum_value) = value else {
        return Ok(value);
    };
    let encoding = encoding.unwrap_or_default();
    let Some(enum_value) = enum_value else {
        return Ok(match encoding {
            EnumEncoding::String => Value::Varchar(None),
            EnumEncoding::Ordinal => Value::Int32(None),
            EnumEncoding::ById => Value::Int64(None),
        });
    };
    Ok(match encoding {
        EnumEncoding::String => Value::Varchar(Some(enum_value.name)),
        EnumEncoding::Ordinal => Value::Int32(Some(enum_value.ordinal as i32)),
        EnumEncoding::ById => match enum_value.id {
            Some(id) => Value::Int64(Some(id)),
            None => {
                return Err(Error::new(EngineError::UnsupportedEnumEncoding {
                    value: enum_value.name.to_string(),
                    target: "i64",
                    encoding,
                }));
            }
        },
    })
}

/// Encode a full entity row, positionally aligned with `entity.fields`.
pub fn encode_row(entity: &EntityDescriptor, row: Row) -> Result<Row> {
    entity
        .fields
        .iter()
        .zip(row.into_vec())
        .map(|(field, value)| encode_value(value, field.enum_encoding))
        .collect()
}

/// Compiles, caches and runs every statement of the engine.
pub struct QueryExecutor<D: Driver> {
    registry: EntityRegistry,
    plans: QueryPlanCache,
    parser: MethodNameParser,
    writer: D::SqlWriter,
    pool: Arc<ConnectionPool<D>>,
    batches: Arc<BatchCollector<PoolSink<D>>>,
}

impl<D: Driver> QueryExecutor<D> {
    pub fn new(pool: Arc<ConnectionPool<D>>, batches: Arc<BatchCollector<PoolSink<D>>>) -> Self {
        Self {
            registry: EntityRegistry::new(),
            plans: QueryPlanCache::new(),
            parser: MethodNameParser::new(),
            writer: pool.driver().sql_writer(),
            pool,
            batches,
        }
    }

    /// Replace the method name parser, to recognize custom connectives.
    pub fn with_parser(mut self, parser: MethodNameParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn plans(&self) -> &QueryPlanCache {
        &self.plans
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<D>> {
        &self.pool
    }

    pub fn batches(&self) -> &Arc<BatchCollector<PoolSink<D>>> {
        &self.batches
    }

    pub fn model<E: Entity>(&self) -> Result<Arc<EntityModel<E>>> {
        self.registry.model::<E>()
    }

    /// Run a repository method, derived from its name when `template` is `None`.
    pub async fn process_query<E: Entity>(
        &self,
        method: &str,
        shape: ReturnShape,
        template: Option<&str>,
        args: Vec<Value>,
    ) -> Result<QueryOutput<E>> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let id = PlanId::new(method, &entity.entity_name, shape.name(), template);
        let plan = self.plans.get_or_try_insert(&id, || match template {
            Some(template) => Ok(QueryPlan::from_template(
                template,
                match shape {
                    ReturnShape::Single => Cardinality::Single,
                    ReturnShape::Multiple => Cardinality::Multiple,
                    ReturnShape::Nothing => Cardinality::None,
                },
            )),
            None => {
                let parts = self.parser.parse(method)?;
                QueryBuilder::new(&self.writer).build(&parts, entity, &entity.fields)
            }
        })?;
        let fetched = self.run_plan(entity, &plan, args).await?;
        Ok(match plan.cardinality {
            Cardinality::Single => {
                QueryOutput::Single(map_rows(&model, &plan, fetched.rows)?.into_iter().next())
            }
            Cardinality::Multiple => QueryOutput::Multiple(map_rows(&model, &plan, fetched.rows)?),
            Cardinality::None => QueryOutput::Nothing,
        })
    }

    /// Run a derived query selecting only `fields`, rows are returned as fetched.
    pub async fn process_projection<E: Entity>(
        &self,
        method: &str,
        fields: &[&str],
        args: Vec<Value>,
    ) -> Result<Vec<RowLabeled>> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let fetched_names = fields.join(",");
        let id = PlanId::new(
            method,
            &entity.entity_name,
            "Projection",
            Some(&fetched_names),
        );
        let plan = self.plans.get_or_try_insert(&id, || {
            let fetch = fields
                .iter()
                .map(|name| entity.field(name).cloned())
                .collect::<Result<Vec<_>>>()?;
            let parts = self.parser.parse(method)?;
            QueryBuilder::new(&self.writer).build(&parts, entity, &fetch)
        })?;
        let mut fetched = self.run_plan(entity, &plan, args).await?;
        if plan.cardinality == Cardinality::Single {
            fetched.rows.truncate(1);
        }
        Ok(fetched.rows)
    }

    pub async fn find_by_id<E: Entity>(&self, id: Value) -> Result<Option<E>> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let plan = self.statement_plan(entity, "$findById", Cardinality::Single, |w, out| {
            w.write_select_by_id(out, entity);
            (vec![entity.identity_field().clone()], entity.fields.to_vec())
        })?;
        let fetched = self.run_plan(entity, &plan, vec![id]).await?;
        Ok(map_rows(&model, &plan, fetched.rows)?.into_iter().next())
    }

    pub async fn find_all<E: Entity>(&self) -> Result<Vec<E>> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let plan = self.statement_plan(entity, "$findAll", Cardinality::Multiple, |w, out| {
            w.write_select_all(out, entity);
            (Vec::new(), entity.fields.to_vec())
        })?;
        let fetched = self.run_plan(entity, &plan, Vec::new()).await?;
        map_rows(&model, &plan, fetched.rows)
    }

    pub async fn count<E: Entity>(&self) -> Result<u64> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let plan = self.statement_plan(entity, "$count", Cardinality::Single, |w, out| {
            w.write_count(out, entity);
            Default::default()
        })?;
        let fetched = self.run_plan(entity, &plan, Vec::new()).await?;
        let Some(value) = fetched.rows.first().and_then(|row| row.values.first()) else {
            return Ok(0);
        };
        value
            .as_i128()
            .and_then(|v| u64::try_from(v).ok())
            .ok_or_else(|| Error::msg(format!("Unexpected count value `{}` from `{}`", value, plan.sql)))
    }

    pub async fn delete<E: Entity>(&self, record: &E) -> Result<RowsAffected> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let id = model.identity(record);
        if id.is_null() {
            return Err(Error::new(EngineError::MissingIdentity {
                entity: entity.entity_name.to_string(),
                field: entity.identity_field().name.to_string(),
            }));
        }
        let plan = self.statement_plan(entity, "$deleteById", Cardinality::None, |w, out| {
            w.write_delete_by_id(out, entity);
            (vec![entity.identity_field().clone()], Vec::new())
        })?;
        Ok(self.run_plan(entity, &plan, vec![id]).await?.affected)
    }

    pub async fn delete_all<E: Entity>(&self) -> Result<RowsAffected> {
        let model = self.model::<E>()?;
        let entity = model.descriptor();
        let plan = self.statement_plan(entity, "$deleteAll", Cardinality::None, |w, out| {
            w.write_delete_all(out, entity);
            Default::default()
        })?;
        Ok(self.run_plan(entity, &plan, Vec::new()).await?.affected)
    }

    /// Single-row insert of every field of `entity`.
    pub fn insert_plan(&self, entity: &EntityDescriptor) -> Result<Arc<QueryPlan>> {
        self.statement_plan(entity, "$insert", Cardinality::None, |w, out| {
            w.write_insert(out, entity);
            (entity.fields.to_vec(), Vec::new())
        })
    }

    /// Insert `record` now, or add it to the batch of its entity when it declares one.
    pub async fn insert<E: Entity>(&self, model: &EntityModel<E>, record: &E) -> Result<()> {
        let entity = model.descriptor();
        let plan = self.insert_plan(entity)?;
        let row = encode_row(entity, model.row(record))?;
        if entity.batch_size.is_some() {
            let key = BatchKey::new(plan.sql.clone(), entity.clone());
            return self.batches.put(key, row).await;
        }
        self.run_plan(entity, &plan, row.into_vec()).await?;
        Ok(())
    }

    fn statement_plan<F>(
        &self,
        entity: &EntityDescriptor,
        statement: &str,
        cardinality: Cardinality,
        render: F,
    ) -> Result<Arc<QueryPlan>>
    where
        F: FnOnce(&D::SqlWriter, &mut String) -> (Vec<FieldDescriptor>, Vec<FieldDescriptor>),
    {
        let id = PlanId::new(statement, &entity.entity_name, "", None);
        self.plans.get_or_try_insert(&id, || {
            let mut sql = String::with_capacity(128);
            let (bound_fields, fetched_fields) = render(&self.writer, &mut sql);
            Ok(QueryPlan {
                sql: sql.into(),
                bound_fields,
                fetched_fields,
                cardinality,
                from_template: false,
            })
        })
    }

    /// Flush pending writes of `entity`, bind `args` and run `plan` on a pooled connection.
    async fn run_plan(
        &self,
        entity: &EntityDescriptor,
        plan: &QueryPlan,
        args: Vec<Value>,
    ) -> Result<Fetched> {
        if let Err(e) = self.batches.flush_entity(entity).await {
            // The rows are spilled, reading what made it to the store is still meaningful
            log::warn!(
                "Reading `{}` after a failed flush: {:#}",
                entity.table_name,
                e
            );
        }
        let expected = plan.placeholders();
        if args.len() != expected {
            let e = Error::new(EngineError::PlaceholderArgumentCountMismatch {
                expected,
                actual: args.len(),
            })
            .context(format!("While running `{}`", truncate_long!(plan.sql)));
            log::error!("{:#}", e);
            return Err(e);
        }
        let params = args
            .into_iter()
            .enumerate()
            .map(|(i, value)| {
                encode_value(
                    value,
                    plan.bound_fields.get(i).and_then(|f| f.enum_encoding),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        let query = Query::with_params(plan.sql.clone(), params);
        let mut connection = self.pool.acquire().await?;
        let result = fetch(&mut *connection, plan.cardinality, query).await;
        self.pool.release(connection).await;
        result.map_err(|e| {
            let e = e.context(format!("While running `{}`", truncate_long!(plan.sql)));
            log::error!("{:#}", e);
            e
        })
    }
}

async fn fetch<C: Connection>(
    connection: &mut C,
    cardinality: Cardinality,
    query: Query,
) -> Result<Fetched> {
    Ok(match cardinality {
        Cardinality::Single => {
            let mut stream = pin!(connection.fetch(query));
            Fetched {
                rows: stream.try_next().await?.into_iter().collect(),
                ..Default::default()
            }
        }
        Cardinality::Multiple => Fetched {
            rows: connection.fetch(query).try_collect().await?,
            ..Default::default()
        },
        Cardinality::None => Fetched {
            affected: connection.execute(query).await?,
            ..Default::default()
        },
    })
}

/// Map fetched rows into records.
///
/// Derived plans are mapped positionally against the selected fields,
/// template plans by matching the column labels against field and column names.
fn map_rows<E: Entity>(
    model: &EntityModel<E>,
    plan: &QueryPlan,
    rows: Vec<RowLabeled>,
) -> Result<Vec<E>> {
    let entity = model.descriptor();
    let positional = (!plan.from_template).then(|| {
        plan.fetched_fields
            .iter()
            .map(|f| entity.field_index(&f.name))
            .collect::<Vec<_>>()
    });
    rows.into_iter()
        .map(|row| {
            let indexes = match &positional {
                Some(indexes) => indexes.clone(),
                None => row
                    .labels
                    .iter()
                    .map(|label| {
                        entity.fields.iter().position(|f| {
                            f.column_name.eq_ignore_ascii_case(label)
                                || f.name.eq_ignore_ascii_case(label)
                        })
                    })
                    .collect(),
            };
            let (fields, values): (Vec<usize>, Vec<Value>) = indexes
                .into_iter()
                .zip(row.values.into_vec())
                .filter_map(|(index, value)| index.map(|i| (i, value)))
                .unzip();
            model.from_values(fields, values)
        })
        .collect()
}
