use anchorsafe_core::ResourceKind;

/// Largest page the remote API accepts.
pub const MAX_PAGE_SIZE: u32 = 250;

/// Where a resource lives on the remote API and which columns to request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub endpoint: String,
    pub columns: Option<&'static str>,
}

impl ResourceDescriptor {
    /// Base query for list requests. Page sizes outside `1..=250` are left
    /// to the server default.
    pub fn query(&self, page_size: u32) -> Vec<(String, String)> {
        let mut query = Vec::new();
        if let Some(columns) = self.columns {
            query.push(("columns".to_string(), columns.to_string()));
        }
        if (1..=MAX_PAGE_SIZE).contains(&page_size) {
            query.push(("pageSize".to_string(), page_size.to_string()));
        }
        query
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceRegistry {
    company_id: i64,
}

impl ResourceRegistry {
    pub fn new(company_id: i64) -> Self {
        Self { company_id }
    }

    pub fn company_id(&self) -> i64 {
        self.company_id
    }

    pub fn descriptor(&self, kind: ResourceKind) -> ResourceDescriptor {
        let company = self.company_id;
        let (endpoint, columns) = match kind {
            ResourceKind::Jobs => (
                format!("companies/{company}/jobs/"),
                Some("ID,Type,Customer,Site,Name,Stage,CustomFields,CompletedDate"),
            ),
            ResourceKind::Customers => (format!("companies/{company}/customers/companies/"), None),
            ResourceKind::Employees => (
                format!("companies/{company}/employees/"),
                Some("ID,Name,Position"),
            ),
            ResourceKind::Sites => (
                format!("companies/{company}/sites/"),
                Some("ID,Name,Address,Customers,Archived"),
            ),
            ResourceKind::Assets => (
                format!("companies/{company}/customerAssets/"),
                Some("ID,AssetType,Site,CustomFields"),
            ),
        };
        ResourceDescriptor {
            kind,
            endpoint,
            columns,
        }
    }

    pub fn all(&self) -> Vec<ResourceDescriptor> {
        ResourceKind::ALL
            .iter()
            .map(|kind| self.descriptor(*kind))
            .collect()
    }
}
