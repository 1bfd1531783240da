//! Rules shipped with the engine
//!
//! These keep shared instance worlds (worlds whose name starts with [`SHARED_INSTANCE_PREFIX`])
//! alive and persistent, so they can be reused instead of being torn down and recreated each
//! time a portal is opened.

use super::PatchRule;
use crate::patch::script::{Cond, Expr, Stmt};
use crate::patch::{Guard, MethodSignature, PatchStrategy, PrologueGuard, Replacement};

pub const SHARED_INSTANCE_PREFIX: &str = "instance-shared-";

const WORLD: &str = "com/hypixel/hytale/server/core/universe/world/World";
const WORLD_CONFIG: &str = "com/hypixel/hytale/server/core/universe/world/WorldConfig";
const STORE: &str = "com/hypixel/hytale/component/Store";
const FUTURE: &str = "java/util/concurrent/CompletableFuture";
const LOGGER: &str = "com/hypixel/hytale/logger/HytaleLogger";
const LOGGER_API: &str = "com/hypixel/hytale/logger/HytaleLogger$Api";

/// All built-in rules
pub fn rules() -> Vec<PatchRule> {
    vec![
        rule(
            "skip deleting shared instance worlds on removal",
            WORLD,
            "validateDeleteOnRemove",
            "()V",
            validate_delete_on_remove(),
            100,
        ),
        rule(
            "persist shared instance worlds when saving their config",
            "com/hypixel/hytale/server/core/universe/system/WorldConfigSaveSystem",
            "saveWorldConfigAndResources",
            "(Lcom/hypixel/hytale/server/core/universe/world/World;)Ljava/util/concurrent/CompletableFuture;",
            save_world_config_and_resources(),
            100,
        ),
        rule(
            "never remove shared instance worlds, evaluate every removal condition",
            "com/hypixel/hytale/builtin/instances/removal/RemovalSystem",
            "shouldRemoveWorld",
            "(Lcom/hypixel/hytale/component/Store;)Z",
            should_remove_world(),
            50,
        ),
        rule(
            "return portals of shared instances use the instance's own UUID",
            "com/hypixel/hytale/builtin/portals/ui/PortalDeviceSummonPage",
            "spawnReturnPortal",
            "(Lcom/hypixel/hytale/server/core/universe/world/World;Lcom/hypixel/hytale/builtin/portals/resources/PortalWorld;Ljava/util/UUID;Ljava/lang/String;)Ljava/util/concurrent/CompletableFuture;",
            spawn_return_portal(),
            0,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

fn rule(
    description: &str,
    owner: &str,
    name: &str,
    descriptor: &str,
    strategy: impl Into<PatchStrategy>,
    priority: i32,
) -> Option<PatchRule> {
    match MethodSignature::new(owner, name, descriptor) {
        Ok(target) => Some(PatchRule::new(description, target, strategy, priority)),
        Err(err) => {
            log::error!("dropping built-in rule '{}': {:?}", description, err);
            None
        }
    }
}

/// `name != null && name.startsWith(SHARED_INSTANCE_PREFIX)`
fn is_shared_instance(name: Expr) -> Cond {
    Cond::All(vec![
        Cond::NotNull(name.clone()),
        Cond::True(Expr::call_virtual(
            name,
            "java/lang/String",
            "startsWith",
            "(Ljava/lang/String;)Z",
            vec![Expr::string(SHARED_INSTANCE_PREFIX)],
        )),
    ])
}

fn world_call(world: Expr, name: &str, descriptor: &str) -> Expr {
    Expr::call_virtual(world, WORLD, name, descriptor, vec![])
}

fn config_call(config: Expr, name: &str, descriptor: &str, args: Vec<Expr>) -> Expr {
    Expr::call_virtual(config, WORLD_CONFIG, name, descriptor, args)
}

/// ```java
/// if (name != null && name.startsWith("instance-shared-")) return;
/// if (worldConfig.isDeleteOnRemove()) {
///     try {
///         FileUtil.deleteDirectory(getSavePath());
///     } catch (Throwable t) {
///         logger.at(Level.SEVERE).withCause(t).log("Exception while deleting world on remove:");
///     }
/// }
/// ```
fn validate_delete_on_remove() -> Replacement {
    let field = |name: &str, descriptor: &str| Expr::field(Expr::This, WORLD, name, descriptor);
    let world_config = field(
        "worldConfig",
        "Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;",
    );
    let severe = Expr::call_virtual(
        field("logger", "Lcom/hypixel/hytale/logger/HytaleLogger;"),
        LOGGER,
        "at",
        "(Ljava/util/logging/Level;)Lcom/hypixel/hytale/logger/HytaleLogger$Api;",
        vec![Expr::static_field(
            "java/util/logging/Level",
            "SEVERE",
            "Ljava/util/logging/Level;",
        )],
    );
    let with_cause = Expr::call_interface(
        severe,
        LOGGER_API,
        "withCause",
        "(Ljava/lang/Throwable;)Lcom/hypixel/hytale/logger/HytaleLogger$Api;",
        vec![Expr::local("error")],
    );

    Replacement {
        descriptor: "()V".to_owned(),
        body: vec![
            Stmt::If {
                cond: is_shared_instance(field("name", "Ljava/lang/String;")),
                then: vec![Stmt::Return(None)],
                otherwise: vec![],
            },
            Stmt::If {
                cond: Cond::True(config_call(world_config, "isDeleteOnRemove", "()Z", vec![])),
                then: vec![Stmt::TryCatch {
                    body: vec![Stmt::Eval(Expr::call_static(
                        "com/hypixel/hytale/server/core/util/io/FileUtil",
                        "deleteDirectory",
                        "(Ljava/nio/file/Path;)V",
                        vec![world_call(Expr::This, "getSavePath", "()Ljava/nio/file/Path;")],
                    ))],
                    catch_type: Some("java/lang/Throwable".to_owned()),
                    binding: Some("error".to_owned()),
                    handler: vec![Stmt::Eval(Expr::call_interface(
                        with_cause,
                        LOGGER_API,
                        "log",
                        "(Ljava/lang/String;)V",
                        vec![Expr::string("Exception while deleting world on remove:")],
                    ))],
                }],
                otherwise: vec![],
            },
            Stmt::Return(None),
        ],
    }
}

/// ```java
/// WorldConfig config = world.getWorldConfig();
/// String name = world.getName();
/// if (name != null && name.startsWith("instance-shared-")) {
///     if (config.isDeleteOnUniverseStart()) config.setDeleteOnUniverseStart(false);
///     if (config.isDeleteOnRemove()) config.setDeleteOnRemove(false);
///     config.markChanged();
/// }
/// if (config.isSavingConfig() && config.consumeHasChanged()) {
///     return CompletableFuture.allOf(
///         world.getChunkStore().getStore().saveAllResources(),
///         world.getEntityStore().getStore().saveAllResources(),
///         Universe.get().getWorldConfigProvider()
///             .save(world.getSavePath(), world.getWorldConfig(), world));
/// }
/// return CompletableFuture.allOf(
///     world.getChunkStore().getStore().saveAllResources(),
///     world.getEntityStore().getStore().saveAllResources());
/// ```
fn save_world_config_and_resources() -> Replacement {
    let world = Expr::Arg(0);
    let config = || Expr::local("config");
    let clear_flag = |getter: &str, setter: &str| Stmt::If {
        cond: Cond::True(config_call(config(), getter, "()Z", vec![])),
        then: vec![Stmt::Eval(config_call(
            config(),
            setter,
            "(Z)V",
            vec![Expr::Bool(false)],
        ))],
        otherwise: vec![],
    };
    let save_resources = |store_getter: &str, store_class: &str| {
        let store = Expr::call_virtual(
            world_call(Expr::Arg(0), store_getter, &format!("()L{};", store_class)),
            store_class,
            "getStore",
            "()Lcom/hypixel/hytale/component/Store;",
            vec![],
        );
        Expr::call_virtual(
            store,
            STORE,
            "saveAllResources",
            "()Ljava/util/concurrent/CompletableFuture;",
            vec![],
        )
    };
    let all_of = |futures: Vec<Expr>| {
        Expr::call_static(
            FUTURE,
            "allOf",
            "([Ljava/util/concurrent/CompletableFuture;)Ljava/util/concurrent/CompletableFuture;",
            vec![Expr::ObjectArray {
                element_class: FUTURE.to_owned(),
                elements: futures,
            }],
        )
    };
    let save_config = Expr::call_interface(
        Expr::call_virtual(
            Expr::call_static(
                "com/hypixel/hytale/server/core/universe/Universe",
                "get",
                "()Lcom/hypixel/hytale/server/core/universe/Universe;",
                vec![],
            ),
            "com/hypixel/hytale/server/core/universe/Universe",
            "getWorldConfigProvider",
            "()Lcom/hypixel/hytale/server/core/universe/world/WorldConfigProvider;",
            vec![],
        ),
        "com/hypixel/hytale/server/core/universe/world/WorldConfigProvider",
        "save",
        "(Ljava/nio/file/Path;Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;Lcom/hypixel/hytale/server/core/universe/world/World;)Ljava/util/concurrent/CompletableFuture;",
        vec![
            world_call(world.clone(), "getSavePath", "()Ljava/nio/file/Path;"),
            world_call(
                world.clone(),
                "getWorldConfig",
                "()Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;",
            ),
            world.clone(),
        ],
    );
    let chunk_store = "com/hypixel/hytale/server/core/universe/world/storage/ChunkStore";
    let entity_store = "com/hypixel/hytale/server/core/universe/world/storage/EntityStore";

    Replacement {
        descriptor: "(Lcom/hypixel/hytale/server/core/universe/world/World;)Ljava/util/concurrent/CompletableFuture;".to_owned(),
        body: vec![
            Stmt::Let {
                name: "config".to_owned(),
                descriptor: format!("L{};", WORLD_CONFIG),
                value: world_call(
                    world.clone(),
                    "getWorldConfig",
                    "()Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;",
                ),
            },
            Stmt::Let {
                name: "name".to_owned(),
                descriptor: "Ljava/lang/String;".to_owned(),
                value: world_call(world, "getName", "()Ljava/lang/String;"),
            },
            Stmt::If {
                cond: is_shared_instance(Expr::local("name")),
                then: vec![
                    clear_flag("isDeleteOnUniverseStart", "setDeleteOnUniverseStart"),
                    clear_flag("isDeleteOnRemove", "setDeleteOnRemove"),
                    Stmt::Eval(config_call(config(), "markChanged", "()V", vec![])),
                ],
                otherwise: vec![],
            },
            Stmt::If {
                cond: Cond::All(vec![
                    Cond::True(config_call(config(), "isSavingConfig", "()Z", vec![])),
                    Cond::True(config_call(config(), "consumeHasChanged", "()Z", vec![])),
                ]),
                then: vec![Stmt::Return(Some(all_of(vec![
                    save_resources("getChunkStore", chunk_store),
                    save_resources("getEntityStore", entity_store),
                    save_config,
                ])))],
                otherwise: vec![],
            },
            Stmt::Return(Some(all_of(vec![
                save_resources("getChunkStore", chunk_store),
                save_resources("getEntityStore", entity_store),
            ]))),
        ],
    }
}

/// ```java
/// World world = ((ChunkStore) store.getExternalData()).getWorld();
/// boolean shared = world.getName() != null && world.getName().startsWith("instance-shared-");
/// InstanceWorldConfig config = InstanceWorldConfig.get(world.getWorldConfig());
/// if (config == null) return false;
/// RemovalCondition[] conditions = config.getRemovalConditions();
/// if (conditions.length == 0) return false;
/// boolean remove = true;
/// for (RemovalCondition condition : conditions) remove &= condition.shouldRemoveWorld(store);
/// return !shared && remove;
/// ```
fn should_remove_world() -> Replacement {
    let instance_config = "com/hypixel/hytale/builtin/instances/config/InstanceWorldConfig";
    let chunk_store = "com/hypixel/hytale/server/core/universe/world/storage/ChunkStore";
    let condition = "com/hypixel/hytale/builtin/instances/removal/RemovalCondition";
    let world = Expr::call_virtual(
        Expr::CheckCast {
            value: Box::new(Expr::call_virtual(
                Expr::Arg(0),
                STORE,
                "getExternalData",
                "()Ljava/lang/Object;",
                vec![],
            )),
            class: chunk_store.to_owned(),
        },
        chunk_store,
        "getWorld",
        "()Lcom/hypixel/hytale/server/core/universe/world/World;",
        vec![],
    );

    Replacement {
        descriptor: "(Lcom/hypixel/hytale/component/Store;)Z".to_owned(),
        body: vec![
            Stmt::Let {
                name: "world".to_owned(),
                descriptor: format!("L{};", WORLD),
                value: world,
            },
            Stmt::Let {
                name: "shared".to_owned(),
                descriptor: "Z".to_owned(),
                value: Expr::Bool(false),
            },
            Stmt::If {
                cond: is_shared_instance(world_call(
                    Expr::local("world"),
                    "getName",
                    "()Ljava/lang/String;",
                )),
                then: vec![Stmt::Assign {
                    name: "shared".to_owned(),
                    value: Expr::Bool(true),
                }],
                otherwise: vec![],
            },
            Stmt::Let {
                name: "config".to_owned(),
                descriptor: format!("L{};", instance_config),
                value: Expr::call_static(
                    instance_config,
                    "get",
                    "(Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;)Lcom/hypixel/hytale/builtin/instances/config/InstanceWorldConfig;",
                    vec![world_call(
                        Expr::local("world"),
                        "getWorldConfig",
                        "()Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;",
                    )],
                ),
            },
            Stmt::If {
                cond: Cond::IsNull(Expr::local("config")),
                then: vec![Stmt::Return(Some(Expr::Bool(false)))],
                otherwise: vec![],
            },
            Stmt::Let {
                name: "conditions".to_owned(),
                descriptor: format!("[L{};", condition),
                value: Expr::call_virtual(
                    Expr::local("config"),
                    instance_config,
                    "getRemovalConditions",
                    "()[Lcom/hypixel/hytale/builtin/instances/removal/RemovalCondition;",
                    vec![],
                ),
            },
            Stmt::If {
                cond: Cond::False(Expr::ArrayLength(Box::new(Expr::local("conditions")))),
                then: vec![Stmt::Return(Some(Expr::Bool(false)))],
                otherwise: vec![],
            },
            Stmt::AllOf {
                result: "remove".to_owned(),
                array: Expr::local("conditions"),
                element: "condition".to_owned(),
                test: Cond::True(Expr::call_interface(
                    Expr::local("condition"),
                    condition,
                    "shouldRemoveWorld",
                    "(Lcom/hypixel/hytale/component/Store;)Z",
                    vec![Expr::Arg(0)],
                )),
            },
            Stmt::If {
                cond: Cond::True(Expr::local("shared")),
                then: vec![Stmt::Return(Some(Expr::Bool(false)))],
                otherwise: vec![],
            },
            Stmt::Return(Some(Expr::local("remove"))),
        ],
    }
}

/// Before the original body:
///
/// ```java
/// if (world != null && world.getName() != null && world.getName().startsWith("instance-shared-")) {
///     sampleUuid = world.getWorldConfig().getUuid();
/// }
/// ```
fn spawn_return_portal() -> PrologueGuard {
    let name = || world_call(Expr::Arg(0), "getName", "()Ljava/lang/String;");
    PrologueGuard {
        guards: vec![Guard {
            condition: Cond::All(vec![Cond::NotNull(Expr::Arg(0)), is_shared_instance(name())]),
            tail: vec![Stmt::SetArg {
                index: 2,
                value: config_call(
                    world_call(
                        Expr::Arg(0),
                        "getWorldConfig",
                        "()Lcom/hypixel/hytale/server/core/universe/world/WorldConfig;",
                    ),
                    "getUuid",
                    "()Ljava/util/UUID;",
                    vec![],
                ),
            }],
        }],
    }
}
