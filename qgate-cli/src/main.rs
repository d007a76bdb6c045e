use std::collections::BTreeSet;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use qgate_audit::{verify_log, AuditLog};
use qgate_core::{EchoExecutor, NullApprovalGateway, Orchestrator};
use qgate_grant::{CapabilityGrant, GrantTier, GrantsFile, InMemoryGrantDirectory};
use qgate_infer::StaticGenerator;
use qgate_schema::{DescriptorRegistry, SchemaDescriptor};
use qgate_store::InMemoryRequestStore;
use qgate_template::{NullMatcher, TemplatesFile};
use qgate_types::{QueryAction, QueryParams, RequestOptions, StructuredQuery};

#[derive(Parser)]
#[command(name = "qgate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the whole pipeline offline with a built-in schema and a stub
    /// generator.
    Demo,
    /// Inspect or verify the audit log.
    Audit {
        #[command(subcommand)]
        action: AuditCommand,
        #[arg(long, default_value = "./audit.jsonl")]
        path: String,
    },
    /// Validate authored YAML config before deploying it.
    Check {
        /// Descriptor files, comma-separated.
        #[arg(long)]
        descriptors: String,
        #[arg(long)]
        grants: Option<String>,
        #[arg(long)]
        templates: Option<String>,
    },
}

#[derive(Subcommand)]
enum AuditCommand {
    Tail {
        #[arg(long, default_value_t = 10)]
        lines: usize,
    },
    Verify,
}

const DEMO_DESCRIPTOR: &str = r#"
id: 7a0e2c66-3d11-4f2e-9b7a-5a8c1f0d9e21
name: demo-crm
version: "1.0.0"
is_active: true
entities:
  User:
    actions: [read-many, read-one, count]
    fields: [id, email, name]
    field_types:
      id: uuid
      email: string
      name: string
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Demo => demo().await?,
        Command::Audit { action, path } => match action {
            AuditCommand::Tail { lines } => {
                let content = std::fs::read_to_string(&path)?;
                let all: Vec<&str> = content.lines().collect();
                let start = all.len().saturating_sub(lines);
                for line in &all[start..] {
                    println!("{line}");
                }
            }
            AuditCommand::Verify => {
                verify_log(&path)?;
                println!("audit log ok");
            }
        },
        Command::Check {
            descriptors,
            grants,
            templates,
        } => check(&descriptors, grants.as_deref(), templates.as_deref()).await?,
    }

    Ok(())
}

async fn demo() -> anyhow::Result<()> {
    let descriptor = SchemaDescriptor::parse_yaml(DEMO_DESCRIPTOR)?;
    let descriptor_id = descriptor.id;
    let mut registry = DescriptorRegistry::new();
    registry.insert(descriptor)?;
    let registry = Arc::new(registry);

    let directory = Arc::new(InMemoryGrantDirectory::new(Arc::clone(&registry)));
    let agent_id = Uuid::new_v4();
    directory
        .add(CapabilityGrant {
            id: Uuid::new_v4(),
            agent_id,
            descriptor_id,
            tier: GrantTier::ReadOnly,
            entities: BTreeSet::new(),
            actions: BTreeSet::new(),
            max_queries_per_day: 100,
            requires_approval: false,
            is_active: true,
        })
        .await?;

    // Stands in for the generative backend.
    let canned = StructuredQuery {
        entity: "User".into(),
        action: QueryAction::ReadMany,
        params: QueryParams {
            select: vec!["id".into(), "email".into()],
            ..Default::default()
        },
    };

    let audit_path = std::env::temp_dir().join("qgate_demo_audit.jsonl");
    let orchestrator = Orchestrator::new(
        directory,
        Arc::new(NullMatcher),
        Arc::new(StaticGenerator::for_query(&canned)),
        Arc::new(InMemoryRequestStore::new()),
        Arc::new(NullApprovalGateway),
        Arc::new(EchoExecutor),
        Arc::new(AuditLog::open(&audit_path)?),
    );

    let prompt = "list every user with their email";
    println!("prompt: {prompt}");

    let ticket = orchestrator
        .create_query_request(agent_id, Uuid::new_v4(), None, prompt, RequestOptions::default())
        .await?;
    let request = orchestrator.get_query_request(ticket.request_id).await?;

    println!("query:  {}", request.generated_query);
    println!("status: {}", request.status.as_str());
    if let Some(result) = &request.execution_result {
        println!("result: {result}");
    }
    println!("audit:  {}", audit_path.display());
    Ok(())
}

async fn check(
    descriptors: &str,
    grants: Option<&str>,
    templates: Option<&str>,
) -> anyhow::Result<()> {
    let mut registry = DescriptorRegistry::new();
    for path in descriptors.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let yaml = std::fs::read_to_string(path)?;
        let descriptor = SchemaDescriptor::parse_yaml(&yaml)?;
        println!("descriptor ok: {} (version {})", descriptor.name, descriptor.version);
        registry.insert(descriptor)?;
    }
    let registry = Arc::new(registry);

    if let Some(path) = grants {
        let yaml = std::fs::read_to_string(path)?;
        let directory = InMemoryGrantDirectory::new(Arc::clone(&registry));
        let loaded = GrantsFile::parse_yaml(&yaml)?
            .load_into(&registry, &directory)
            .await?;
        println!("grants ok: {loaded}");
    }

    if let Some(path) = templates {
        let yaml = std::fs::read_to_string(path)?;
        let templates = TemplatesFile::parse_yaml(&yaml)?;
        println!("templates ok: {}", templates.len());
    }

    Ok(())
}
