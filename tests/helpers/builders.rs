use serde_json::Value;
use warden::authz::{Principal, Resource};

/// Builder for test principals
pub struct UserBuilder {
    id: String,
    roles: Vec<String>,
    tenant: Option<String>,
    attributes: Vec<(String, Value)>,
}

impl UserBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            roles: Vec::new(),
            tenant: None,
            attributes: Vec::new(),
        }
    }

    pub fn role(mut self, role: &str) -> Self {
        self.roles.push(role.to_string());
        self
    }

    pub fn tenant(mut self, tenant: &str) -> Self {
        self.tenant = Some(tenant.to_string());
        self
    }

    pub fn attr(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.push((key.to_string(), value.into()));
        self
    }

    pub fn build(self) -> Principal {
        let mut principal = Principal::new(self.id).with_roles(self.roles);
        if let Some(tenant) = self.tenant {
            principal = principal.with_attr("tenantId", tenant);
        }
        for (k, v) in self.attributes {
            principal = principal.with_attr(k, v);
        }
        principal
    }
}

/// Builder for `lead` resources
pub struct LeadBuilder {
    resource: Resource,
}

impl LeadBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            resource: Resource::new("lead").with_id(id),
        }
    }

    pub fn owner(mut self, owner: &str) -> Self {
        self.resource = self.resource.with_attr("ownerId", owner);
        self
    }

    pub fn tenant(mut self, tenant: &str) -> Self {
        self.resource = self.resource.with_attr("tenantId", tenant);
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.resource = self.resource.with_attr("status", status);
        self
    }

    pub fn amount(mut self, amount: impl Into<Value>) -> Self {
        self.resource = self.resource.with_attr("amount", amount);
        self
    }

    pub fn archived(mut self) -> Self {
        self.resource = self.resource.with_attr("archived", true);
        self
    }

    pub fn build(self) -> Resource {
        self.resource
    }
}
