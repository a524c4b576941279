use ormstate::prelude::*;
use ormstate::NaturalId;
use std::sync::Arc;

#[derive(Default)]
struct Writer {
    next_id: i64,
    log: Vec<String>,
}

impl EntityWriter for Writer {
    fn insert(
        &mut self,
        descriptor: &EntityDescriptor,
        id: Option<&Identifier>,
        _state: &[AttributeValue],
    ) -> Result<Option<Identifier>> {
        self.log.push(format!("insert {}", descriptor.name()));
        if id.is_some() {
            return Ok(None);
        }
        self.next_id += 1;
        Ok(Some(Identifier::from(100 + self.next_id)))
    }

    fn delete(&mut self, descriptor: &EntityDescriptor, id: &Identifier) -> Result<()> {
        self.log.push(format!("delete {} {id}", descriptor.name()));
        Ok(())
    }
}

fn open() -> Session {
    let metamodel = Metamodel::new()
        .with(
            EntityDescriptor::new("Customer", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                .attribute(AttributeDescriptor::basic("email"))
                .natural_id(&["email"]),
        )
        .with(
            EntityDescriptor::new("Order", IdentifierDescriptor::new("id", IdGenerator::Sequence))
                .attribute(AttributeDescriptor::basic("number"))
                .attribute(AttributeDescriptor::many_to_one("customer", "Customer").nullable(false)),
        );
    Arc::new(SessionFactory::new(metamodel, FactoryConfig::default())).open_session()
}

fn customer(session: &Session, email: &str) -> EntityHandle {
    let handle = EntityHandle::new(session.descriptor("Customer").unwrap().instantiate(None));
    handle.write().set_value(0, AttributeValue::basic(email));
    handle
}

fn order(session: &Session, customer: &EntityHandle) -> EntityHandle {
    let handle = EntityHandle::new(session.descriptor("Order").unwrap().instantiate(None));
    handle.write().set_value(0, AttributeValue::basic("A-1"));
    handle.write().set_value(1, AttributeValue::entity(customer));
    handle
}

#[test]
fn order_saved_first_is_inserted_after_its_customer() {
    let mut session = open();
    let alice = customer(&session, "alice@example.com");
    let first = order(&session, &alice);

    session.save(&first, false).unwrap();
    assert_eq!(session.actions().unresolved().len(), 1);
    session.save(&alice, false).unwrap();

    let mut writer = Writer::default();
    let result = session.flush(&mut writer).unwrap();
    assert_eq!(result.inserted, 2);
    assert_eq!(writer.log, vec!["insert Customer", "insert Order"]);
    assert!(session.actions().is_empty());

    // the stored reference survived nullification
    let entry = session.context().get_entry(&first).unwrap();
    assert_eq!(entry.status(), EntityStatus::Managed);
    assert_eq!(entry.loaded_state().unwrap()[1], AttributeValue::entity(&alice));
    assert!(session.dirty_attributes(&first).unwrap().is_empty());
}

#[test]
fn flush_names_the_unsaved_reference() {
    let mut session = open();
    let alice = customer(&session, "alice@example.com");
    let first = order(&session, &alice);
    session.save(&first, false).unwrap();

    let mut writer = Writer::default();
    let err = session.flush(&mut writer).unwrap_err();
    assert!(err.is_transient_reference());
    assert_eq!(err.property_path(), Some("customer"));
    assert!(err.to_string().contains("Order.customer"));
    assert!(writer.log.is_empty());

    session.save(&alice, false).unwrap();
    assert_eq!(session.flush(&mut writer).unwrap().total(), 2);
}

#[test]
fn inserted_keys_and_natural_ids_are_recorded() {
    let mut session = open();
    let alice = customer(&session, "alice@example.com");
    session.save(&alice, false).unwrap();
    session.flush(&mut Writer::default()).unwrap();

    let id = alice.id().unwrap();
    assert_eq!(id, Identifier::from(101));
    let key = EntityKey::new("Customer", id.clone());
    assert!(session.context().was_inserted_during_transaction(&key));
    assert_eq!(
        session
            .natural_ids()
            .find_id("Customer", &NaturalId::new(vec![Value::Text("alice@example.com".into())])),
        Some(&id)
    );

    session.end_transaction();
    assert!(!session.context().was_inserted_during_transaction(&key));
    assert!(session.get("Customer", 101).unwrap().is_some());
}

#[test]
fn deleted_entity_leaves_the_session() {
    let mut session = open();
    let alice = customer(&session, "alice@example.com");
    let first = order(&session, &alice);
    session.save(&alice, false).unwrap();
    session.save(&first, false).unwrap();
    let mut writer = Writer::default();
    session.flush(&mut writer).unwrap();

    session.delete(&first).unwrap();
    assert_eq!(session.actions().delete_count(), 1);
    let result = session.flush(&mut writer).unwrap();
    assert_eq!(result.deleted, 1);
    assert_eq!(writer.log.last().map(String::as_str), Some("delete Order 102"));
    assert!(session.get("Order", 102).unwrap().is_none());
}
