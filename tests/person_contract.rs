// Per-instance and per-type private attribute behavior through a small owning type.
use private_attrs::api::{ErrorKind, Instance, InstanceKey, Store, StoreOptions};
use serde_json::Value;

struct Person<'s> {
    key: InstanceKey,
    name: String,
    attrs: &'s Store,
}

impl<'s> Person<'s> {
    fn new(attrs: &'s Store, name: &str, surname: &str, ssn: u64) -> Self {
        let person = Self {
            key: InstanceKey::mint(),
            name: name.to_string(),
            attrs,
        };
        attrs.register_instance(&person).expect("register");
        let view = attrs.attrs(&person);
        view.set("surname_static", surname).expect("surname");
        view.set("ssn", ssn).expect("ssn");
        person
    }

    fn ssn(&self) -> u64 {
        self.attrs
            .attrs(self)
            .get("ssn")
            .ok()
            .and_then(|value| value.as_u64())
            .expect("ssn")
    }

    fn surname(&self) -> String {
        match self.attrs.attrs(self).get("surname_static") {
            Ok(Value::String(surname)) => surname,
            other => panic!("unexpected surname: {other:?}"),
        }
    }

    fn set_surname(&self, surname: &str) {
        self.attrs
            .attrs(self)
            .set("surname_static", surname)
            .expect("surname");
    }
}

impl Instance for Person<'_> {
    fn instance_key(&self) -> InstanceKey {
        self.key
    }

    fn type_name(&self) -> &str {
        "Person"
    }
}

impl PartialEq for Person<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.ssn() == other.ssn()
    }
}

impl Drop for Person<'_> {
    fn drop(&mut self) {
        self.attrs.delete(self);
    }
}

fn person_store() -> Store {
    Store::with_options(StoreOptions::new().with_owner("Person")).expect("store")
}

#[test]
fn person_with_private_attrs() {
    let store = person_store();
    let p1 = Person::new(&store, "John", "Doe", 123);
    let p2 = Person::new(&store, "Alice", "Jackson", 123);
    let p3 = Person::new(&store, "James", "Potter", 456);
    assert!(p1 == p2);
    assert!(p1 != p3);
    assert_eq!(p1.name, "John");

    // Code outside the type only has its own store; it cannot reach Person's table.
    let outsider = Store::local();
    let err = outsider
        .set_private_attr("ssn", 456, &p1)
        .expect_err("not registered with the outsider");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(p1.ssn(), 123);
    assert_eq!(p3.ssn(), 456);
}

#[test]
fn person_with_private_static_attrs() {
    let store = person_store();
    let p1 = Person::new(&store, "John", "Doe", 123);
    let p2 = Person::new(&store, "Alice", "Jackson", 456);
    assert_eq!(p1.surname(), "Jackson");
    p1.set_surname("Potter");
    assert_eq!(p2.surname(), "Potter");
}

#[test]
fn private_values_stay_per_instance() {
    let store = person_store();
    let a = Person::new(&store, "A", "Doe", 1);
    let b = Person::new(&store, "B", "Doe", 2);
    store.set_private_attr("nickname", "ace", &a).expect("set");

    assert_eq!(store.get_private_attr("nickname", &a).expect("get"), Value::from("ace"));
    let err = store.get_private_attr("nickname", &b).expect_err("not b's");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(
        err.message(),
        Some("'Person' object has no private attribute 'nickname'")
    );
    assert_eq!(store.get_private_attr_or("nickname", &b, Value::Null).expect("default"), Value::Null);
}

#[test]
fn dropping_an_instance_releases_its_entry() {
    let store = person_store();
    let key = {
        let person = Person::new(&store, "Temp", "Doe", 7);
        assert!(store.is_registered(&person).expect("registered"));
        person.instance_key()
    };
    assert!(!store.is_registered(&key).expect("registered"));
    store.delete(&key);
    assert_eq!(store.get_static_private_attr("surname_static").expect("static"), Value::from("Doe"));
}
