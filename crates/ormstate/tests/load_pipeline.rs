use ormstate::prelude::*;
use ormstate::{CacheKey, CacheValue, EntityDataAccess, SoftLock};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn metamodel() -> Metamodel {
    Metamodel::new()
        .with(
            EntityDescriptor::new("Employee", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                .attribute(AttributeDescriptor::basic("name"))
                .attribute(AttributeDescriptor::many_to_one("manager", "Employee"))
                .attribute(AttributeDescriptor::basic("version"))
                .version("version")
                .cacheable("employees"),
        )
        .with(
            EntityDescriptor::new("Department", IdentifierDescriptor::new("code", IdGenerator::Assigned))
                .attribute(AttributeDescriptor::basic("title"))
                .immutable(),
        )
}

fn employee(id: i64, name: &str, manager: Option<i64>) -> Row {
    Row::from_values(vec![
        Value::BigInt(id),
        Value::Text(name.to_string()),
        manager.map_or(Value::Null, Value::BigInt),
        Value::BigInt(1),
    ])
}

fn factory(config: FactoryConfig) -> Arc<SessionFactory> {
    init_tracing();
    Arc::new(SessionFactory::new(metamodel(), config.statistics_enabled(true)))
}

#[test]
fn materialized_entity_is_managed_with_clean_snapshot() {
    let factory = factory(FactoryConfig::default());
    let mut session = factory.open_session();
    let _span = tracing::info_span!("round_trip").entered();

    let loaded = session
        .load("Employee", vec![employee(1, "Ada", None)].into_iter(), &LoadOptions::default())
        .unwrap();
    let entry = session.context().get_entry(&loaded[0]).unwrap();
    assert_eq!(entry.status(), EntityStatus::Managed);
    assert_eq!(entry.version(), Some(&Value::BigInt(1)));
    assert!(session.dirty_attributes(&loaded[0]).unwrap().is_empty());

    loaded[0].write().set_value(0, AttributeValue::basic("Ada L."));
    assert_eq!(session.dirty_attributes(&loaded[0]).unwrap(), vec!["name".to_string()]);
}

#[test]
fn immutable_and_proxied_entities_load_read_only() {
    let factory = factory(FactoryConfig::default());
    let mut session = factory.open_session();

    let departments = session
        .load(
            "Department",
            vec![Row::from_values(vec![Value::Text("R&D".into()), Value::Text("Research".into())])]
                .into_iter(),
            &LoadOptions::default(),
        )
        .unwrap();
    assert_eq!(
        session.context().get_entry(&departments[0]).unwrap().status(),
        EntityStatus::ReadOnly
    );

    session
        .context_mut()
        .add_proxy(EntityKey::new("Employee", Identifier::from(2)), true);
    let employees = session
        .load("Employee", vec![employee(2, "Grace", None)].into_iter(), &LoadOptions::default())
        .unwrap();
    let entry = session.context().get_entry(&employees[0]).unwrap();
    assert_eq!(entry.status(), EntityStatus::ReadOnly);
    assert!(entry.snapshot().is_none());
    assert!(session.dirty_attributes(&employees[0]).unwrap().is_empty());
}

#[test]
fn duplicate_rows_keep_first_instance_and_single_entry() {
    let factory = factory(FactoryConfig::default());
    let mut session = factory.open_session();
    let rows = vec![employee(1, "Ada", None), employee(1, "Ada", None), employee(2, "Grace", Some(1))];
    let loaded = session.load("Employee", rows.into_iter(), &LoadOptions::default()).unwrap();

    assert_eq!(loaded.len(), 3);
    assert!(loaded[0].same_instance(&loaded[1]));
    assert_eq!(session.context().len(), 2);
    assert_eq!(factory.statistics().snapshot().duplicate_hydrations, 1);
    assert_eq!(factory.statistics().entity_load_count("Employee"), 2);
}

#[test]
fn post_load_observes_fully_wired_batch() {
    let factory = factory(FactoryConfig::default());
    let mut session = factory.open_session();
    let managers = Rc::new(RefCell::new(Vec::new()));
    let seen = Rc::clone(&managers);
    session.on_post_load(move |event| {
        let manager = event.entity.read().value(1).cloned();
        if let Some(AttributeValue::Entity(EntityReference::Loaded(manager))) = manager {
            let name = manager.read().value(0).cloned();
            seen.borrow_mut().push(name);
        }
        Ok(())
    });

    // the report comes before its manager in the result
    let rows = vec![employee(1, "Report", Some(2)), employee(2, "Boss", None)];
    session.load("Employee", rows.into_iter(), &LoadOptions::default()).unwrap();

    assert_eq!(*managers.borrow(), vec![Some(AttributeValue::basic("Boss"))]);
}

#[test]
fn pre_load_error_aborts_load() {
    let factory = factory(FactoryConfig::default());
    let mut session = factory.open_session();
    session.on_pre_load(|event| {
        if event.id == Identifier::from(2) {
            return Err(Error::Listener("employee 2 is off limits".into()));
        }
        Ok(())
    });
    let rows = vec![employee(1, "Ada", None), employee(2, "Grace", None)];
    let err = session.load("Employee", rows.into_iter(), &LoadOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Listener(_)));
}

#[derive(Debug, Default)]
struct RefusingRegion {
    calls: Mutex<Vec<String>>,
}

impl EntityDataAccess for RefusingRegion {
    fn region_name(&self) -> &str {
        "employees"
    }

    fn get(&self, _key: &CacheKey) -> Option<CacheValue> {
        None
    }

    fn put_from_load(
        &self,
        _key: &CacheKey,
        _value: CacheValue,
        version: Option<&Value>,
        minimal_put: bool,
    ) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(format!("put_from_load(version={version:?}, minimal={minimal_put})"));
        false
    }

    fn update(
        &self,
        _key: &CacheKey,
        _value: CacheValue,
        current_version: Option<&Value>,
        previous_version: Option<&Value>,
    ) -> bool {
        assert_eq!(current_version, previous_version);
        self.calls.lock().unwrap().push("update".to_string());
        false
    }

    fn lock_item(&self, _key: &CacheKey, _version: Option<&Value>) -> SoftLock {
        unreachable!("loads never lock")
    }

    fn unlock_item(&self, _key: &CacheKey, _lock: SoftLock) {}

    fn evict(&self, _key: &CacheKey) {}
}

#[test]
fn cache_refusals_are_absorbed_and_not_counted() {
    let region = Arc::new(RefusingRegion::default());
    init_tracing();
    let factory = Arc::new(
        SessionFactory::new(metamodel(), FactoryConfig::default().statistics_enabled(true).minimal_puts(true))
            .with_region(Arc::clone(&region) as Arc<dyn EntityDataAccess>),
    );

    let mut session = factory.open_session();
    session
        .load("Employee", vec![employee(1, "Ada", None)].into_iter(), &LoadOptions::default())
        .unwrap();

    // same-transaction insert goes through update
    let mut other = factory.open_session();
    other
        .context_mut()
        .register_insert_during_transaction(EntityKey::new("Employee", Identifier::from(1)));
    other
        .load("Employee", vec![employee(1, "Ada", None)].into_iter(), &LoadOptions::default())
        .unwrap();

    // refresh disables minimal puts
    let mut refreshing = factory.open_session_with(SessionConfig::default().cache_mode(CacheMode::Refresh));
    refreshing
        .load("Employee", vec![employee(1, "Ada", None)].into_iter(), &LoadOptions::default())
        .unwrap();

    assert_eq!(
        *region.calls.lock().unwrap(),
        vec![
            "put_from_load(version=Some(BigInt(1)), minimal=true)".to_string(),
            "update".to_string(),
            "put_from_load(version=Some(BigInt(1)), minimal=false)".to_string(),
        ]
    );
    assert_eq!(factory.statistics().cache_put_count("employees"), 0);
    assert_eq!(factory.statistics().entity_load_count("Employee"), 3);
}

#[test]
fn statistics_snapshot_serializes() {
    let factory = factory(FactoryConfig::default());
    let mut session = factory.open_session();
    session
        .load("Employee", vec![employee(1, "Ada", None)].into_iter(), &LoadOptions::default())
        .unwrap();
    let json = serde_json::to_value(factory.statistics().snapshot()).unwrap();
    assert_eq!(json["entity_loads"], 1);
    assert_eq!(json["cache_puts"], 1);
}
